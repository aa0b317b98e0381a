use serde::Deserialize;
use serde_json::Value;

use crate::config::FirmwareTransport;

pub const DEFAULT_CHECKSUM_ALGORITHM: &str = "sha256";

/// Shared-attribute keys of a firmware announcement, as delivered by the
/// platform either as a direct attribute push or nested under `shared` in
/// an attribute-request response.
#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareAttributes {
    pub fw_title: String,
    pub fw_version: String,
    #[serde(default)]
    pub fw_checksum: String,
    #[serde(default)]
    pub fw_checksum_algorithm: Option<String>,
    pub fw_size: u64,
    #[serde(default)]
    pub fw_chunk_size: Option<u32>,
}

impl FirmwareAttributes {
    /// Extracts firmware attributes from an attribute-push document.
    /// Returns `None` when the document carries no firmware announcement
    /// (attribute pushes also deliver unrelated shared attributes).
    pub fn from_attribute_push(payload: &[u8]) -> Option<Self> {
        let doc: Value = serde_json::from_slice(payload).ok()?;
        Self::from_value(&doc)
    }

    /// Extracts firmware attributes from an attribute-request response,
    /// where they arrive nested under a `shared` object.
    pub fn from_attribute_response(payload: &[u8]) -> Option<Self> {
        let doc: Value = serde_json::from_slice(payload).ok()?;
        Self::from_value(doc.get("shared")?)
    }

    fn from_value(doc: &Value) -> Option<Self> {
        if doc.get("fw_title").is_none() {
            return None;
        }
        serde_json::from_value(doc.clone()).ok()
    }
}

/// One announced update. Immutable for the duration of an attempt;
/// replaced wholesale when the platform re-announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    pub title: String,
    pub version: String,
    pub size: u64,
    pub chunk_size: u32,
    pub checksum: String,
    pub checksum_algorithm: String,
}

impl FirmwareDescriptor {
    /// Builds a descriptor, applying the transport's chunk-size default
    /// when the announcement omits it or carries zero. Returns `None` for
    /// an unusable announcement (zero total size).
    pub fn from_attributes(attrs: FirmwareAttributes, transport: FirmwareTransport) -> Option<Self> {
        if attrs.fw_size == 0 {
            return None;
        }

        let chunk_size = match attrs.fw_chunk_size {
            Some(size) if size > 0 => size,
            _ => transport.default_chunk_size(),
        };

        Some(Self {
            title: attrs.fw_title,
            version: attrs.fw_version,
            size: attrs.fw_size,
            chunk_size,
            checksum: attrs.fw_checksum.trim().to_ascii_lowercase(),
            checksum_algorithm: attrs
                .fw_checksum_algorithm
                .filter(|algo| !algo.is_empty())
                .unwrap_or_else(|| DEFAULT_CHECKSUM_ALGORITHM.to_string())
                .to_ascii_lowercase(),
        })
    }

    pub fn total_chunks(&self) -> u32 {
        (self.size.div_ceil(u64::from(self.chunk_size))) as u32
    }

    /// Length of the chunk at `index`; the final chunk may be short.
    pub fn chunk_len(&self, index: u32) -> u64 {
        let start = u64::from(index) * u64::from(self.chunk_size);
        (self.size - start.min(self.size)).min(u64::from(self.chunk_size))
    }
}

/// Byte/chunk accounting for the current attempt. Owned by the update
/// engine; reset to zero whenever a new announcement is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub offset: u64,
    pub chunks_received: u32,
    pub last_request_ms: Option<u64>,
    pub timeouts: u32,
}

impl TransferProgress {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn attrs(json: &str) -> Option<FirmwareAttributes> {
        FirmwareAttributes::from_attribute_push(json.as_bytes())
    }

    #[test]
    fn parses_full_attribute_push() {
        let parsed = attrs(
            r#"{"fw_title":"sitemon","fw_version":"1.2.0","fw_checksum":"AB12","fw_checksum_algorithm":"sha256","fw_size":20000,"fw_chunk_size":8192}"#,
        )
        .unwrap();
        let descriptor =
            FirmwareDescriptor::from_attributes(parsed, FirmwareTransport::Binary).unwrap();

        assert_eq!(descriptor.title, "sitemon");
        assert_eq!(descriptor.size, 20_000);
        assert_eq!(descriptor.chunk_size, 8_192);
        assert_eq!(descriptor.checksum, "ab12");
        assert_eq!(descriptor.checksum_algorithm, "sha256");
        assert_eq!(descriptor.total_chunks(), 3);
    }

    #[test]
    fn applies_defaults_for_missing_optional_keys() {
        let parsed =
            attrs(r#"{"fw_title":"sitemon","fw_version":"1.2.0","fw_size":4097}"#).unwrap();
        let descriptor =
            FirmwareDescriptor::from_attributes(parsed, FirmwareTransport::Json).unwrap();

        assert_eq!(descriptor.chunk_size, 4_096);
        assert_eq!(descriptor.checksum_algorithm, "sha256");
        assert_eq!(descriptor.total_chunks(), 2);
    }

    #[test]
    fn zero_chunk_size_falls_back_to_default() {
        let parsed = attrs(
            r#"{"fw_title":"sitemon","fw_version":"1.2.0","fw_size":100,"fw_chunk_size":0}"#,
        )
        .unwrap();
        let descriptor =
            FirmwareDescriptor::from_attributes(parsed, FirmwareTransport::Json).unwrap();
        assert_eq!(descriptor.chunk_size, 4_096);
    }

    #[test]
    fn zero_size_announcement_is_rejected() {
        let parsed =
            attrs(r#"{"fw_title":"sitemon","fw_version":"1.2.0","fw_size":0}"#).unwrap();
        assert_eq!(
            FirmwareDescriptor::from_attributes(parsed, FirmwareTransport::Json),
            None
        );
    }

    #[test]
    fn push_without_firmware_keys_is_not_an_announcement() {
        assert!(attrs(r#"{"targetTemp":70}"#).is_none());
    }

    #[test]
    fn response_requires_shared_nesting() {
        let payload =
            br#"{"shared":{"fw_title":"sitemon","fw_version":"2.0.0","fw_size":512}}"#;
        let parsed = FirmwareAttributes::from_attribute_response(payload).unwrap();
        assert_eq!(parsed.fw_version, "2.0.0");

        assert!(FirmwareAttributes::from_attribute_response(
            br#"{"fw_title":"sitemon","fw_version":"2.0.0","fw_size":512}"#
        )
        .is_none());
    }

    #[test]
    fn final_chunk_may_be_short() {
        let parsed = attrs(
            r#"{"fw_title":"sitemon","fw_version":"1.2.0","fw_size":20000,"fw_chunk_size":8192}"#,
        )
        .unwrap();
        let descriptor =
            FirmwareDescriptor::from_attributes(parsed, FirmwareTransport::Binary).unwrap();

        assert_eq!(descriptor.chunk_len(0), 8_192);
        assert_eq!(descriptor.chunk_len(1), 8_192);
        assert_eq!(descriptor.chunk_len(2), 3_616);
    }
}
