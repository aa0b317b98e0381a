use serde::{Deserialize, Serialize};

/// Update lifecycle as reported to the platform. `Idle` is the boot state
/// and is never published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FwState {
    Idle,
    Initiated,
    Downloading,
    Downloaded,
    Updated,
    Failed,
}

impl FwState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Initiated => "INITIATED",
            Self::Downloading => "DOWNLOADING",
            Self::Downloaded => "DOWNLOADED",
            Self::Updated => "UPDATED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Updated | Self::Failed)
    }
}

/// Status notification published on the attributes topic.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FwStatePayload {
    pub fw_state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_error: Option<String>,
}

impl FwStatePayload {
    pub fn new(state: FwState) -> Self {
        Self {
            fw_state: state.as_str(),
            fw_error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            fw_state: FwState::Failed.as_str(),
            fw_error: Some(reason.into()),
        }
    }
}

/// Identity attributes published once per MQTT (re)connect.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentity {
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    #[serde(rename = "deviceType")]
    pub device_type: &'static str,
    #[serde(rename = "deviceName")]
    pub device_name: &'static str,
    #[serde(rename = "fwVersion")]
    pub fw_version: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnvironmentReading {
    pub temperature: f32,
    pub humidity: f32,
    #[serde(rename = "airQuality", skip_serializing_if = "Option::is_none")]
    pub air_quality: Option<i32>,
    #[serde(rename = "peopleCount", skip_serializing_if = "Option::is_none")]
    pub people_count: Option<u32>,
    #[serde(rename = "motionDetected", skip_serializing_if = "Option::is_none")]
    pub motion_detected: Option<bool>,
}

/// Per-slot carpark occupancy, sent only on state change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OccupancyReading {
    pub slot: String,
    pub occupied: bool,
    pub ts: u64,
}
