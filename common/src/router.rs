use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::base64;
use crate::config::FirmwareTransport;
use crate::firmware::FirmwareAttributes;
use crate::topics::{
    self, LED_STATE_KEY, SHARED_ATTRIBUTE_KEYS, TOPIC_ATTRIBUTES, TOPIC_ATTRIBUTES_REQUEST,
    TOPIC_ATTRIBUTES_RESPONSE_SUB, TOPIC_FIRMWARE_REQUEST, TOPIC_FIRMWARE_RESPONSE,
    TOPIC_FIRMWARE_RESPONSE_V2_SUB,
};

/// A firmware chunk extracted from an inbound message. `request_id` and
/// `index` are present only on the topic-encoded binary transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareChunk {
    pub request_id: Option<u32>,
    pub index: Option<u32>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
    FirmwareAnnounced(FirmwareAttributes),
    ChunkDelivered(FirmwareChunk),
    /// The `ledState` shared attribute changed.
    LedState(bool),
}

/// Outbound chunk request, rendered per transport variant.
#[derive(Debug, Clone)]
pub struct ChunkRequest<'a> {
    pub title: &'a str,
    pub version: &'a str,
    pub request_id: u32,
    pub index: u32,
    pub offset: u64,
    pub chunk_size: u32,
}

#[derive(Debug, Serialize)]
struct ChunkRequestBody<'a> {
    title: &'a str,
    version: &'a str,
    #[serde(rename = "chunkSize")]
    chunk_size: u32,
    chunk: String,
}

#[derive(Debug, Deserialize)]
struct ChunkResponseBody {
    data: String,
}

#[derive(Debug, Serialize)]
struct AttributeRequestBody {
    #[serde(rename = "sharedKeys")]
    shared_keys: &'static str,
}

/// Classifies inbound platform messages and renders outbound firmware
/// requests. The transport variant is fixed at construction; there is no
/// per-message format sniffing.
#[derive(Debug, Clone, Copy)]
pub struct MessageRouter {
    transport: FirmwareTransport,
}

impl MessageRouter {
    pub fn new(transport: FirmwareTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> FirmwareTransport {
        self.transport
    }

    /// Topics the device subscribes to after (re)connecting.
    pub fn subscriptions(&self) -> [&'static str; 3] {
        let firmware = match self.transport {
            FirmwareTransport::Json => TOPIC_FIRMWARE_RESPONSE,
            FirmwareTransport::Binary => TOPIC_FIRMWARE_RESPONSE_V2_SUB,
        };
        [TOPIC_ATTRIBUTES, TOPIC_ATTRIBUTES_RESPONSE_SUB, firmware]
    }

    /// Classifies one inbound message. Unrecognized topics and malformed
    /// payloads yield `None`; the caller decides whether to log.
    pub fn route(&self, topic: &str, payload: &[u8]) -> Option<RouterEvent> {
        if topic == TOPIC_ATTRIBUTES {
            if let Some(attrs) = FirmwareAttributes::from_attribute_push(payload) {
                return Some(RouterEvent::FirmwareAnnounced(attrs));
            }
            let doc: Value = serde_json::from_slice(payload).ok()?;
            return led_state(&doc).map(RouterEvent::LedState);
        }

        if topics::is_attribute_response(topic) {
            if let Some(attrs) = FirmwareAttributes::from_attribute_response(payload) {
                return Some(RouterEvent::FirmwareAnnounced(attrs));
            }
            let doc: Value = serde_json::from_slice(payload).ok()?;
            return led_state(doc.get("shared")?).map(RouterEvent::LedState);
        }

        match self.transport {
            FirmwareTransport::Json if topic == TOPIC_FIRMWARE_RESPONSE => {
                let body: ChunkResponseBody = serde_json::from_slice(payload).ok()?;
                Some(RouterEvent::ChunkDelivered(FirmwareChunk {
                    request_id: None,
                    index: None,
                    data: base64::decode_to_vec(&body.data),
                }))
            }
            FirmwareTransport::Binary => {
                let (request_id, index) = topics::parse_firmware_response_v2(topic)?;
                Some(RouterEvent::ChunkDelivered(FirmwareChunk {
                    request_id: Some(request_id),
                    index: Some(index),
                    data: payload.to_vec(),
                }))
            }
            _ => None,
        }
    }

    /// Whether `topic` only ever carries firmware-update payloads, so a
    /// routing miss there means a malformed message worth logging. The
    /// attribute-push topic is excluded: it legitimately delivers
    /// non-firmware attributes.
    pub fn expects_firmware_payload(&self, topic: &str) -> bool {
        if topics::is_attribute_response(topic) {
            return true;
        }
        match self.transport {
            FirmwareTransport::Json => topic == TOPIC_FIRMWARE_RESPONSE,
            FirmwareTransport::Binary => topics::parse_firmware_response_v2(topic).is_some(),
        }
    }

    /// Renders a chunk request as (topic, payload).
    pub fn chunk_request(&self, request: &ChunkRequest<'_>) -> (String, Vec<u8>) {
        match self.transport {
            FirmwareTransport::Json => {
                let body = ChunkRequestBody {
                    title: request.title,
                    version: request.version,
                    chunk_size: request.chunk_size,
                    chunk: request.offset.to_string(),
                };
                (
                    TOPIC_FIRMWARE_REQUEST.to_string(),
                    serde_json::to_vec(&body).unwrap_or_default(),
                )
            }
            FirmwareTransport::Binary => (
                topics::firmware_request_topic_v2(request.request_id, request.index),
                request.chunk_size.to_string().into_bytes(),
            ),
        }
    }

    /// The shared-attribute request issued at connect time to learn about
    /// any firmware announced (and the LED state set) while the device was
    /// offline.
    pub fn attribute_request(&self) -> (String, Vec<u8>) {
        let body = AttributeRequestBody {
            shared_keys: SHARED_ATTRIBUTE_KEYS,
        };
        (
            TOPIC_ATTRIBUTES_REQUEST.to_string(),
            serde_json::to_vec(&body).unwrap_or_default(),
        )
    }
}

fn led_state(doc: &Value) -> Option<bool> {
    doc.get(LED_STATE_KEY)?.as_bool()
}
