pub mod cloud;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod iothub;
pub mod payload;
pub mod protocol;
pub mod queue;
pub mod settings;
pub mod time;
pub mod types;
pub mod upgrade;

pub use cloud::{CloudService, CloudServiceCommand, ConnectionStrings, DiscoveryService, HealthCheckService};
pub use config::{
    CloudServiceConfig, ConnectionConfig, DeviceConfig, NetworkConfig, PersistedSettings, RuntimeConfig,
};
pub use connection::{ConnectionAction, ConnectionController, ConnectionControllerTask, Observation};
pub use frame::{Frame, FrameBuilder, FrameBuilderUser, FrameParser, FrameType};
pub use iothub::{DeviceMethodHandler, IotHubConnection, SessionStatus};
pub use payload::{AzurePayload, AzureSyncController, PayloadContext, SyncCache};
pub use queue::{EventFlag, Queue};
pub use settings::{DeviceMeta, MemorySettings, Settings};
pub use time::{AdjustableClock, SystemClock};
pub use types::{AzureStatus, ConnectionState, ControllerStatus, WifiConnectionStatus, WifiCredentials};
pub use upgrade::FirmwareUpgradeController;
