pub const TOPIC_TELEMETRY: &str = "v1/devices/me/telemetry";
pub const TOPIC_ATTRIBUTES: &str = "v1/devices/me/attributes";
pub const TOPIC_ATTRIBUTES_REQUEST: &str = "v1/devices/me/attributes/request/1";
pub const TOPIC_ATTRIBUTES_RESPONSE_PREFIX: &str = "v1/devices/me/attributes/response/";
pub const TOPIC_ATTRIBUTES_RESPONSE_SUB: &str = "v1/devices/me/attributes/response/+";

pub const TOPIC_FIRMWARE_REQUEST: &str = "v1/devices/me/firmware/request";
pub const TOPIC_FIRMWARE_RESPONSE: &str = "v1/devices/me/firmware/response";

pub const TOPIC_FIRMWARE_RESPONSE_V2_SUB: &str = "v2/fw/response/+/chunk/+";

/// Shared attribute keys requested from the platform at connect time.
pub const SHARED_ATTRIBUTE_KEYS: &str =
    "fw_title,fw_version,fw_checksum,fw_checksum_algorithm,fw_size,fw_chunk_size,ledState";

/// Shared attribute driving the white indicator LED.
pub const LED_STATE_KEY: &str = "ledState";

pub fn firmware_request_topic_v2(request_id: u32, chunk_index: u32) -> String {
    format!("v2/fw/request/{request_id}/chunk/{chunk_index}")
}

/// Parses `v2/fw/response/{requestId}/chunk/{index}`.
pub fn parse_firmware_response_v2(topic: &str) -> Option<(u32, u32)> {
    let rest = topic.strip_prefix("v2/fw/response/")?;
    let (request_id, rest) = rest.split_once('/')?;
    let index = rest.strip_prefix("chunk/")?;
    if index.contains('/') {
        return None;
    }
    Some((request_id.parse().ok()?, index.parse().ok()?))
}

pub fn is_attribute_response(topic: &str) -> bool {
    topic.starts_with(TOPIC_ATTRIBUTES_RESPONSE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_response_topic_round_trip() {
        let topic = firmware_request_topic_v2(7, 3).replace("request", "response");
        assert_eq!(parse_firmware_response_v2(&topic), Some((7, 3)));
    }

    #[test]
    fn v2_response_rejects_malformed_topics() {
        assert_eq!(parse_firmware_response_v2("v2/fw/response/7/chunk"), None);
        assert_eq!(
            parse_firmware_response_v2("v2/fw/response/7/chunk/x"),
            None
        );
        assert_eq!(
            parse_firmware_response_v2("v2/fw/response/7/chunk/3/extra"),
            None
        );
        assert_eq!(parse_firmware_response_v2("v1/devices/me/attributes"), None);
    }
}
