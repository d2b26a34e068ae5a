use serde::{Deserialize, Serialize};

use crate::protocol::firmware::FirmwareVersion;
use crate::types::{DayProgram, ForgetMeState, HeatingMode, Override, Temperature, WifiCredentials};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudServiceConfig {
    pub discovery_url: String,
    pub health_check_url: String,
    pub discovery_retry_interval_ms: u64,
    pub health_retry_interval_ms: u64,
    pub health_backoff_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_tries_without_backoff: u8,
    pub health_tries_with_backoff: u8,
    pub unpause_poll_interval_ms: u64,
    pub http_timeout_ms: u64,
}

impl Default for CloudServiceConfig {
    fn default() -> Self {
        Self {
            discovery_url: "https://discovery.appliance-cloud.example/api/discovery".to_string(),
            health_check_url: "https://discovery.appliance-cloud.example/api/healthcheck".to_string(),
            discovery_retry_interval_ms: 30_000,
            health_retry_interval_ms: 10_000,
            health_backoff_interval_ms: 300_000,
            health_check_interval_ms: 3_600_000,
            health_tries_without_backoff: 3,
            health_tries_with_backoff: 5,
            unpause_poll_interval_ms: 5_000,
            http_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub loop_period_ms: u64,
    pub short_loop_period_ms: u64,
    pub cloud_pause_timeout_ms: u64,
    pub iot_hub_connect_timeout_ms: u64,
    pub wifi_setup_timeout_ms: u64,
    pub fw_upgrade_timeout_ms: u64,
    pub reset_azure_idle_budget_ms: u64,
    pub reset_cloud_pause_budget_ms: u64,
    pub reset_wifi_disconnect_budget_ms: u64,
    pub reboot_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            loop_period_ms: 1_000,
            short_loop_period_ms: 100,
            cloud_pause_timeout_ms: 120_000,
            iot_hub_connect_timeout_ms: 300_000,
            wifi_setup_timeout_ms: 600_000,
            fw_upgrade_timeout_ms: 900_000,
            reset_azure_idle_budget_ms: 10_000,
            reset_cloud_pause_budget_ms: 60_000,
            reset_wifi_disconnect_budget_ms: 10_000,
            reboot_delay_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi: WifiCredentials,
    /// Restored by a factory reset.
    pub default_wifi: WifiCredentials,
    /// Broker port for the IoT-Hub MQTT session.
    #[serde(default = "default_iot_hub_port")]
    pub iot_hub_port: u16,
}

fn default_iot_hub_port() -> u16 {
    8883
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi: WifiCredentials::default(),
            default_wifi: WifiCredentials::default(),
            iot_hub_port: default_iot_hub_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Decimal digits, packed as BCD on the wire.
    pub gdid: String,
    pub firmware_version: FirmwareVersion,
    pub company_code: u16,
    pub bt_passkey: u32,
    pub direct_appliance: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gdid: "0000000000000000".to_string(),
            firmware_version: FirmwareVersion {
                major: 1,
                minor: 0,
                patch: 0,
            },
            company_code: 0x0001,
            bt_passkey: 123_456,
            direct_appliance: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub comfort_setpoint: Temperature,
    pub eco_setpoint: Temperature,
    pub heating_mode: HeatingMode,
    #[serde(default, rename = "override")]
    pub override_: Override,
    pub button_lock: bool,
    pub utc_offset_secs: i32,
    /// Monday first.
    pub week_program: Vec<DayProgram>,
    #[serde(default)]
    pub forget_me: ForgetMeState,
    /// Consecutive failed firmware upgrades.
    #[serde(default)]
    pub fw_upgrade_failures: u8,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            comfort_setpoint: Temperature::clamped(42),
            eco_setpoint: Temperature::clamped(34),
            heating_mode: HeatingMode::Comfort,
            override_: Override::none(),
            button_lock: false,
            utc_offset_secs: 0,
            week_program: vec![DayProgram::default(); 7],
            forget_me: ForgetMeState::NotRequested,
            fw_upgrade_failures: 0,
        }
    }
}

/// UTC offsets range from -12:00 to +14:00.
const UTC_OFFSET_RANGE: std::ops::RangeInclusive<i32> = -12 * 3600..=14 * 3600;

impl PersistedSettings {
    pub fn sanitize(&mut self) {
        self.comfort_setpoint = Temperature::clamped(self.comfort_setpoint.half_degrees());
        self.eco_setpoint = Temperature::clamped(self.eco_setpoint.half_degrees());
        self.utc_offset_secs = self
            .utc_offset_secs
            .clamp(*UTC_OFFSET_RANGE.start(), *UTC_OFFSET_RANGE.end());

        self.week_program.resize(7, DayProgram::default());
        for day in &mut self.week_program {
            day.points.truncate(DayProgram::MAX_POINTS);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub cloud: CloudServiceConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub settings: PersistedSettings,
}

impl CloudServiceConfig {
    pub fn sanitize(&mut self) {
        self.health_tries_without_backoff = self.health_tries_without_backoff.max(1);
        self.health_tries_with_backoff = self.health_tries_with_backoff.max(1);
        self.unpause_poll_interval_ms = self.unpause_poll_interval_ms.clamp(100, 60_000);
        self.http_timeout_ms = self.http_timeout_ms.clamp(1_000, 120_000);
    }
}

impl ConnectionConfig {
    pub fn sanitize(&mut self) {
        self.loop_period_ms = self.loop_period_ms.clamp(10, 10_000);
        self.short_loop_period_ms = self.short_loop_period_ms.clamp(1, self.loop_period_ms);
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.cloud.sanitize();
        self.connection.sanitize();
        self.settings.sanitize();
        if self.network.iot_hub_port == 0 {
            self.network.iot_hub_port = default_iot_hub_port();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_persisted_values() {
        let mut settings = PersistedSettings {
            comfort_setpoint: serde_json::from_str("200").unwrap(),
            utc_offset_secs: 99 * 3600,
            week_program: Vec::new(),
            ..PersistedSettings::default()
        };

        settings.sanitize();

        assert_eq!(settings.comfort_setpoint, Temperature::MAX);
        assert_eq!(settings.utc_offset_secs, 14 * 3600);
        assert_eq!(settings.week_program.len(), 7);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"device": {"gdid": "1234", "firmware_version": {"major": 2, "minor": 0, "patch": 1}, "company_code": 7, "bt_passkey": 1, "direct_appliance": false}}"#)
                .unwrap();

        assert_eq!(runtime.device.gdid, "1234");
        assert_eq!(runtime.cloud.health_tries_without_backoff, 3);
        assert_eq!(runtime.network.iot_hub_port, 8883);
    }
}
