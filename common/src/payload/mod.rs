//! Interpretation of decoded frames as appliance operations.

pub mod azure;
pub mod parameter;
pub mod sync;

use crate::settings::{DeviceMeta, Settings};
use crate::time::SystemClock;

pub use azure::{AzurePayload, DeviceMethodResponse, FirmwareUpgradeControl, FrameOutcome};
pub use parameter::{ParameterDataPayload, ParameterId};
pub use sync::{AzureSyncController, SyncCache};

/// Collaborators a frame handler reads and writes.
#[derive(Clone, Copy)]
pub struct PayloadContext<'a> {
    pub settings: &'a dyn Settings,
    pub device: &'a DeviceMeta,
    pub clock: &'a dyn SystemClock,
    pub sync: &'a SyncCache,
}
