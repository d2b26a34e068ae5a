use chrono::{DateTime, FixedOffset, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeatingMode {
    Comfort,
    Eco,
    AntiFrost,
    Shutdown,
}

impl HeatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comfort => "COMFORT",
            Self::Eco => "ECO",
            Self::AntiFrost => "ANTI_FROST",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Comfort),
            1 => Some(Self::Eco),
            2 => Some(Self::AntiFrost),
            3 => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Comfort => 0,
            Self::Eco => 1,
            Self::AntiFrost => 2,
            Self::Shutdown => 3,
        }
    }
}

/// Setpoint in half-degree Celsius steps, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Temperature(u8);

impl Temperature {
    /// Wire byte meaning "no value" or "read request".
    pub const NO_VALUE: u8 = 0xff;
    pub const MIN: Temperature = Temperature(10);
    pub const MAX: Temperature = Temperature(60);
    pub const ANTI_FROST: Temperature = Temperature(14);

    pub fn from_half_degrees(value: u8) -> Option<Self> {
        (Self::MIN.0..=Self::MAX.0)
            .contains(&value)
            .then_some(Self(value))
    }

    pub fn clamped(value: u8) -> Self {
        Self(value.clamp(Self::MIN.0, Self::MAX.0))
    }

    pub fn half_degrees(self) -> u8 {
        self.0
    }

    pub fn celsius(self) -> f32 {
        f32::from(self.0) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverrideType {
    None,
    Now,
    Constant,
    Timed,
}

/// Temporary heating-mode directive superseding the week program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub kind: OverrideType,
    pub mode: HeatingMode,
    #[serde(default)]
    pub end: Option<DateTime<FixedOffset>>,
}

impl Default for Override {
    fn default() -> Self {
        Self::none()
    }
}

impl Override {
    /// Follow the week program.
    pub fn none() -> Self {
        Self {
            kind: OverrideType::None,
            mode: HeatingMode::Comfort,
            end: None,
        }
    }

    pub fn now(mode: HeatingMode) -> Self {
        Self {
            kind: OverrideType::Now,
            mode,
            end: None,
        }
    }

    pub fn constant(mode: HeatingMode) -> Self {
        Self {
            kind: OverrideType::Constant,
            mode,
            end: None,
        }
    }

    pub fn timed(mode: HeatingMode, end: DateTime<FixedOffset>) -> Self {
        Self {
            kind: OverrideType::Timed,
            mode,
            end: Some(end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
        Self::Sun,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchPoint {
    /// Start of the slot in 10-minute steps after midnight.
    pub start: u8,
    pub mode: HeatingMode,
}

/// One day of the week program as exchanged in 20-byte blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayProgram {
    pub points: Vec<SwitchPoint>,
}

impl DayProgram {
    pub const BLOCK_SIZE: usize = 20;
    pub const MAX_POINTS: usize = Self::BLOCK_SIZE / 2;
    const UNUSED: u8 = 0xff;
    const STEPS_PER_DAY: u8 = 144;

    /// `None` for an all-0xFF block ("leave this day alone") or any malformed
    /// block; points must be strictly ascending.
    pub fn from_block(block: &[u8]) -> Option<Self> {
        if block.len() != Self::BLOCK_SIZE || block.iter().all(|byte| *byte == Self::UNUSED) {
            return None;
        }

        let mut points = Vec::with_capacity(Self::MAX_POINTS);
        for pair in block.chunks_exact(2) {
            let (start, mode) = (pair[0], pair[1]);
            if start == Self::UNUSED {
                continue;
            }
            if start >= Self::STEPS_PER_DAY {
                return None;
            }
            if points
                .last()
                .is_some_and(|last: &SwitchPoint| last.start >= start)
            {
                return None;
            }
            points.push(SwitchPoint {
                start,
                mode: HeatingMode::from_wire(mode)?,
            });
        }
        Some(Self { points })
    }

    pub fn to_block(&self) -> [u8; Self::BLOCK_SIZE] {
        let mut block = [Self::UNUSED; Self::BLOCK_SIZE];
        for (slot, point) in block
            .chunks_exact_mut(2)
            .zip(self.points.iter().take(Self::MAX_POINTS))
        {
            slot[0] = point.start;
            slot[1] = point.mode.to_wire();
        }
        block
    }
}

/// Progress of the cloud account unlinking ("forget me") protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForgetMeState {
    #[default]
    NotRequested,
    Requested,
    ResetConfirmed,
}

/// Status codes reported through the BLE provisioning characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum WifiConnectionStatus {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    WifiNotDiscovered = 3,
    WrongPassword = 4,
    DiscoverySendFailed = 5,
    DiscoveryParseFailed = 6,
    DiscoveryMissingFields = 7,
    IotHubConnected = 8,
}

impl WifiConnectionStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::WifiNotDiscovered
                | Self::WrongPassword
                | Self::DiscoverySendFailed
                | Self::DiscoveryParseFailed
                | Self::DiscoveryMissingFields
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIp {
    pub ip: [u8; 4],
    pub gateway: [u8; 4],
    pub subnet: [u8; 4],
    #[serde(default)]
    pub dns: Option<[u8; 4]>,
}

/// Credentials delivered over BLE (or configured as factory defaults).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
    #[serde(default)]
    pub static_ip: Option<StaticIp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    NotConnected,
    WifiConnecting,
    WifiConnected,
    DiscoveryConnecting,
    DiscoveryConnected,
    IotHubConnecting,
    IotHubConnected,
    ActivatingWifiSetup,
    WaitingForBleOff,
    FwUpgradeInProgress,
    FactoryReset,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 11] = [
        Self::NotConnected,
        Self::WifiConnecting,
        Self::WifiConnected,
        Self::DiscoveryConnecting,
        Self::DiscoveryConnected,
        Self::IotHubConnecting,
        Self::IotHubConnected,
        Self::ActivatingWifiSetup,
        Self::WaitingForBleOff,
        Self::FwUpgradeInProgress,
        Self::FactoryReset,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotConnected => "NOT_CONNECTED",
            Self::WifiConnecting => "WIFI_CONNECTING",
            Self::WifiConnected => "WIFI_CONNECTED",
            Self::DiscoveryConnecting => "DISCOVERY_CONNECTING",
            Self::DiscoveryConnected => "DISCOVERY_CONNECTED",
            Self::IotHubConnecting => "IOT_HUB_CONNECTING",
            Self::IotHubConnected => "IOT_HUB_CONNECTED",
            Self::ActivatingWifiSetup => "ACTIVATING_WIFI_SETUP",
            Self::WaitingForBleOff => "WAITING_FOR_BLE_OFF",
            Self::FwUpgradeInProgress => "FW_UPGRADE_IN_PROGRESS",
            Self::FactoryReset => "FACTORY_RESET",
        }
    }
}

/// Requests other tasks post to the connection controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatusChangeRequest {
    BluetoothOff,
    BluetoothOn,
    FwUpgradeReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirmwareUpgradeState {
    #[default]
    NotRequested,
    Started,
    InProgress,
    Completed,
    Failed,
}

impl FirmwareUpgradeState {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::NotRequested => 0,
            Self::Started => 1,
            Self::InProgress => 2,
            Self::Completed => 3,
            Self::Failed => 4,
        }
    }
}

/// Status of the IoT-Hub session driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AzureStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

/// Snapshot served by the dev API.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(rename = "connectionState")]
    pub connection_state: &'static str,
    #[serde(rename = "cloudPaused")]
    pub cloud_paused: bool,
    #[serde(rename = "discoverySucceeded")]
    pub discovery_succeeded: bool,
    pub health: u8,
    #[serde(rename = "azureStatus")]
    pub azure_status: AzureStatus,
    #[serde(rename = "comfortSetpoint")]
    pub comfort_setpoint: f32,
    #[serde(rename = "ecoSetpoint")]
    pub eco_setpoint: f32,
    #[serde(rename = "heatingMode")]
    pub heating_mode: &'static str,
    #[serde(rename = "override")]
    pub override_: Override,
    #[serde(rename = "buttonLock")]
    pub button_lock: bool,
    #[serde(rename = "forgetMe")]
    pub forget_me: ForgetMeState,
}
