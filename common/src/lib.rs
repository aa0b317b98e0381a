pub mod base64;
pub mod config;
pub mod firmware;
pub mod ota;
pub mod router;
pub mod topics;
pub mod types;

pub use config::{
    DeviceProfile, FirmwareTransport, NetworkConfig, OtaConfig, ProfileConfig, RuntimeConfig,
};
pub use firmware::{FirmwareDescriptor, TransferProgress};
pub use ota::{FirmwareWriter, OtaAction, OtaEngine, OtaError, OtaStatusSnapshot};
pub use router::{ChunkRequest, FirmwareChunk, MessageRouter, RouterEvent};
pub use topics::*;
pub use types::{DeviceIdentity, EnvironmentReading, FwState, FwStatePayload, OccupancyReading};
