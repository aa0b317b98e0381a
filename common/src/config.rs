use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProfile {
    Building,
    Carpark,
}

impl DeviceProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Carpark => "carpark",
        }
    }

    /// Maps a stored device id to its profile by prefix. Unknown prefixes
    /// fall back to Building; callers log the fallback.
    pub fn from_device_id(device_id: &str) -> (Self, bool) {
        let id = device_id.trim().to_ascii_uppercase();
        if id.starts_with("BLD") || id.starts_with("BUILDING") {
            (Self::Building, true)
        } else if id.starts_with("CPK") || id.starts_with("CARPARK") || id.starts_with("PARK") {
            (Self::Carpark, true)
        } else {
            (Self::Building, false)
        }
    }

    pub fn config(self) -> &'static ProfileConfig {
        match self {
            Self::Building => &BUILDING_PROFILE,
            Self::Carpark => &CARPARK_PROFILE,
        }
    }
}

/// Static per-profile feature table. Which sensors a monitor carries and how
/// often it reports them is fixed per profile; only network credentials and
/// OTA tuning are runtime-configurable.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub device_name: &'static str,
    pub has_ultrasonic: bool,
    pub ultrasonic_slots: u8,
    pub enable_temp_humidity: bool,
    pub enable_air_quality: bool,
    pub enable_pir: bool,
    pub env_sensor_interval_ms: u64,
    pub pir_interval_ms: u64,
    pub ultrasonic_interval_ms: u64,
}

pub static BUILDING_PROFILE: ProfileConfig = ProfileConfig {
    device_name: "Building_Control_System",
    has_ultrasonic: false,
    ultrasonic_slots: 0,
    enable_temp_humidity: true,
    enable_air_quality: true,
    enable_pir: true,
    env_sensor_interval_ms: 15_000,
    pir_interval_ms: 5_000,
    ultrasonic_interval_ms: 0,
};

pub static CARPARK_PROFILE: ProfileConfig = ProfileConfig {
    device_name: "Carpark_Management_System",
    has_ultrasonic: true,
    ultrasonic_slots: 10,
    enable_temp_humidity: true,
    enable_air_quality: true,
    enable_pir: true,
    env_sensor_interval_ms: 30_000,
    pir_interval_ms: 5_000,
    ultrasonic_interval_ms: 5_000,
};

/// Which wire shape firmware chunks use. Selected once at configuration
/// time; the router owns one decode path per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareTransport {
    /// `v1/devices/me/firmware/*` with base64 chunk data inside a JSON
    /// `data` field.
    Json,
    /// `v2/fw/*` topic-encoded requests with raw binary chunk payloads.
    Binary,
}

impl FirmwareTransport {
    pub fn default_chunk_size(self) -> u32 {
        match self {
            Self::Json => 4096,
            Self::Binary => 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub access_token: String,
    pub device_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "app.coreiot.io".to_string(),
            mqtt_port: 1883,
            access_token: String::new(),
            device_id: "BLD-000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaConfig {
    pub transport: FirmwareTransport,
    pub tick_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub restart_delay_ms: u64,
    /// Consecutive chunk-request timeouts tolerated before the attempt is
    /// failed. `None` retries forever, one re-request per timeout period.
    pub max_chunk_retries: Option<u32>,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            transport: FirmwareTransport::Json,
            tick_interval_ms: 500,
            request_timeout_ms: 5_000,
            restart_delay_ms: 2_000,
            max_chunk_retries: None,
        }
    }
}

impl OtaConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(100, 10_000);
        self.request_timeout_ms = self.request_timeout_ms.clamp(1_000, 120_000);
        self.restart_delay_ms = self.restart_delay_ms.clamp(500, 30_000);
        // A timeout shorter than the tick would re-request on every tick.
        if self.request_timeout_ms < self.tick_interval_ms * 2 {
            self.request_timeout_ms = self.tick_interval_ms * 2;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub ota: OtaConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.ota.sanitize();
    }

    pub fn profile(&self) -> DeviceProfile {
        DeviceProfile::from_device_id(&self.network.device_id).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_prefix_selects_profile() {
        assert_eq!(
            DeviceProfile::from_device_id("BLD-17"),
            (DeviceProfile::Building, true)
        );
        assert_eq!(
            DeviceProfile::from_device_id("building-a"),
            (DeviceProfile::Building, true)
        );
        assert_eq!(
            DeviceProfile::from_device_id("CPK-03"),
            (DeviceProfile::Carpark, true)
        );
        assert_eq!(
            DeviceProfile::from_device_id("park-north"),
            (DeviceProfile::Carpark, true)
        );
    }

    #[test]
    fn unknown_device_id_falls_back_to_building() {
        let (profile, recognized) = DeviceProfile::from_device_id("XYZ-9");
        assert_eq!(profile, DeviceProfile::Building);
        assert!(!recognized);
    }

    #[test]
    fn profile_tables_match_hardware() {
        assert!(!DeviceProfile::Building.config().has_ultrasonic);
        assert_eq!(DeviceProfile::Carpark.config().ultrasonic_slots, 10);
        assert_eq!(
            DeviceProfile::Carpark.config().env_sensor_interval_ms,
            30_000
        );
    }

    #[test]
    fn sanitize_keeps_timeout_above_tick() {
        let mut ota = OtaConfig {
            tick_interval_ms: 4_000,
            request_timeout_ms: 1_000,
            ..OtaConfig::default()
        };
        ota.sanitize();
        assert!(ota.request_timeout_ms >= ota.tick_interval_ms * 2);
    }
}
