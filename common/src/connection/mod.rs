//! Top-level connectivity state machine.
//!
//! [`ConnectionController::tick`] is pure: it reads an [`Observation`] of the
//! collaborators plus whatever is waiting in the [`ControllerInbox`] and
//! returns the [`ConnectionAction`]s the task runner must perform. Per-state
//! timeouts end in a reboot, which is the recovery path for every stuck
//! state.

pub mod task;

use log::{debug, error, info, warn};

use crate::cloud::{ConnectionStrings, FULL_HEALTH};
use crate::config::ConnectionConfig;
use crate::types::{
    AzureStatus, ConnectionState, ConnectionStatusChangeRequest, FirmwareUpgradeState,
    ForgetMeState, WifiConnectionStatus, WifiCredentials,
};

pub use task::ConnectionControllerTask;

/// Collaborator state sampled once per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub wifi_connected: bool,
    /// Outcome of the last connect attempt, if it failed.
    pub wifi_connect_failure: Option<WifiConnectionStatus>,
    pub cloud_paused: bool,
    pub discovery_succeeded: bool,
    pub health: u8,
    pub azure_status: AzureStatus,
    pub azure_unable_to_send: bool,
    pub gatt_running: bool,
    pub forget_me: ForgetMeState,
    pub firmware_state: FirmwareUpgradeState,
}

impl Default for Observation {
    fn default() -> Self {
        Self {
            wifi_connected: false,
            wifi_connect_failure: None,
            cloud_paused: true,
            discovery_succeeded: false,
            health: 0,
            azure_status: AzureStatus::Idle,
            azure_unable_to_send: false,
            gatt_running: false,
            forget_me: ForgetMeState::NotRequested,
            firmware_state: FirmwareUpgradeState::NotRequested,
        }
    }
}

/// Messages other tasks leave for the controller.
pub trait ControllerInbox {
    /// Provisioning results to mirror on the BLE status characteristic.
    fn next_bt_result(&mut self) -> Option<WifiConnectionStatus>;
    fn next_status_request(&mut self) -> Option<ConnectionStatusChangeRequest>;
    /// Credentials delivered over BLE.
    fn next_reconnect(&mut self) -> Option<WifiCredentials>;
    /// Drains the queue, keeping only the newest strings.
    fn latest_connection_strings(&mut self) -> Option<ConnectionStrings>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    ConnectWifi,
    DisconnectWifi,
    ReconfigureWifi(WifiCredentials),
    RestoreDefaultWifi,
    PauseCloud,
    UnpauseCloud,
    IdleAzure,
    ConnectAzure(String),
    StartGatt,
    StopGatt,
    ReportWifiStatus(WifiConnectionStatus),
    PersistCredentials(WifiCredentials),
    StartFirmwareUpgrade,
    FactoryReset,
    Reboot { delay_ms: u64 },
}

/// Steps of the factory reset shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ResetStep {
    #[default]
    IdleAzure,
    PauseCloud,
    DisconnectWifi,
    Reset,
}

/// Bookkeeping that lives only as long as the current state.
#[derive(Debug, Clone, Default)]
struct StateMemory {
    wifi_connect_requested: bool,
    pause_requested: bool,
    unpause_requested: bool,
    idle_requested: bool,
    disconnect_requested: bool,
    gatt_requested: bool,
    waiting_for_reconnect: bool,
    azure_attempts: u8,
    attempts_exhausted_logged: bool,
    upgrade_started: bool,
    reset_step: ResetStep,
    reset_step_started_ms: u64,
}

pub struct ConnectionController {
    config: ConnectionConfig,
    state: ConnectionState,
    entered_at_ms: u64,
    state_changed: bool,
    memory: StateMemory,
    connection_strings: Option<ConnectionStrings>,
    rebooting: bool,
}

impl ConnectionController {
    pub fn new(config: ConnectionConfig, now_ms: u64) -> Self {
        Self {
            config,
            state: ConnectionState::NotConnected,
            entered_at_ms: now_ms,
            state_changed: false,
            memory: StateMemory::default(),
            connection_strings: None,
            rebooting: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_rebooting(&self) -> bool {
        self.rebooting
    }

    /// Milliseconds to sleep before the next tick; short right after a
    /// transition so the new state is evaluated quickly.
    pub fn sleep_period_ms(&self) -> u64 {
        if self.state_changed {
            self.config.short_loop_period_ms
        } else {
            self.config.loop_period_ms
        }
    }

    fn set_state(&mut self, state: ConnectionState, now_ms: u64) {
        if state != self.state {
            info!("connection state {} -> {}", self.state.as_str(), state.as_str());
        }
        self.state = state;
        self.entered_at_ms = now_ms;
        self.state_changed = true;
        self.memory = StateMemory::default();
        self.memory.reset_step_started_ms = now_ms;
    }

    fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.entered_at_ms)
    }

    fn reboot(&mut self, actions: &mut Vec<ConnectionAction>, delay_ms: u64) {
        if !self.rebooting {
            self.rebooting = true;
            actions.push(ConnectionAction::Reboot { delay_ms });
        }
    }

    /// One controller iteration.
    pub fn tick(
        &mut self,
        obs: &Observation,
        inbox: &mut dyn ControllerInbox,
        now_ms: u64,
    ) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.rebooting {
            return actions;
        }
        self.state_changed = false;

        if obs.forget_me == ForgetMeState::ResetConfirmed
            && self.state != ConnectionState::FactoryReset
        {
            info!("forget-me confirmed, starting factory reset");
            self.set_state(ConnectionState::FactoryReset, now_ms);
        } else if let Some(status) = inbox.next_bt_result() {
            actions.push(ConnectionAction::ReportWifiStatus(status));
            if status.is_failure() && obs.gatt_running {
                warn!("provisioning failed with {status:?}, back to wifi setup");
                self.set_state(ConnectionState::ActivatingWifiSetup, now_ms);
            }
        } else if let Some(request) = inbox.next_status_request() {
            self.handle_status_request(request, &mut actions, now_ms);
        }

        if !self.state_changed {
            self.update(obs, inbox, &mut actions, now_ms);
        }
        actions
    }

    fn handle_status_request(
        &mut self,
        request: ConnectionStatusChangeRequest,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        debug!("status change request {request:?} in {}", self.state.as_str());
        match request {
            ConnectionStatusChangeRequest::BluetoothOn => {
                if self.state == ConnectionState::FactoryReset {
                    warn!("ignoring bluetooth activation during factory reset");
                } else {
                    self.set_state(ConnectionState::ActivatingWifiSetup, now_ms);
                }
            }
            ConnectionStatusChangeRequest::BluetoothOff => {
                actions.push(ConnectionAction::StopGatt);
                if self.state == ConnectionState::ActivatingWifiSetup {
                    self.set_state(ConnectionState::NotConnected, now_ms);
                }
            }
            ConnectionStatusChangeRequest::FwUpgradeReady => {
                if self.state == ConnectionState::FactoryReset {
                    warn!("ignoring firmware upgrade during factory reset");
                } else {
                    self.set_state(ConnectionState::FwUpgradeInProgress, now_ms);
                }
            }
        }
    }

    fn update(
        &mut self,
        obs: &Observation,
        inbox: &mut dyn ControllerInbox,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        match self.state {
            ConnectionState::NotConnected => self.update_not_connected(obs, actions, now_ms),
            ConnectionState::WifiConnecting => self.update_wifi_connecting(obs, actions, now_ms),
            ConnectionState::WifiConnected => {
                if obs.gatt_running {
                    actions.push(ConnectionAction::ReportWifiStatus(WifiConnectionStatus::Connected));
                }
                self.set_state(ConnectionState::DiscoveryConnecting, now_ms);
            }
            ConnectionState::DiscoveryConnecting => {
                self.update_discovery_connecting(obs, actions, now_ms)
            }
            ConnectionState::DiscoveryConnected => {
                if !obs.wifi_connected {
                    self.set_state(ConnectionState::NotConnected, now_ms);
                } else {
                    self.set_state(ConnectionState::IotHubConnecting, now_ms);
                }
            }
            ConnectionState::IotHubConnecting => {
                self.update_iot_hub_connecting(obs, inbox, actions, now_ms)
            }
            ConnectionState::IotHubConnected => self.update_iot_hub_connected(obs, actions, now_ms),
            ConnectionState::ActivatingWifiSetup => {
                self.update_activating_wifi_setup(obs, inbox, actions, now_ms)
            }
            ConnectionState::WaitingForBleOff => {
                if !obs.wifi_connected {
                    self.set_state(ConnectionState::NotConnected, now_ms);
                } else if !obs.gatt_running {
                    self.set_state(ConnectionState::DiscoveryConnecting, now_ms);
                }
            }
            ConnectionState::FwUpgradeInProgress => {
                self.update_fw_upgrade(obs, actions, now_ms)
            }
            ConnectionState::FactoryReset => self.update_factory_reset(obs, actions, now_ms),
        }
    }

    fn update_not_connected(
        &mut self,
        obs: &Observation,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        if obs.wifi_connected {
            self.set_state(ConnectionState::WifiConnected, now_ms);
            return;
        }
        if !obs.cloud_paused {
            if !self.memory.pause_requested {
                self.memory.pause_requested = true;
                actions.push(ConnectionAction::PauseCloud);
            }
            if self.elapsed_ms(now_ms) > self.config.cloud_pause_timeout_ms {
                error!("cloud service did not pause in time, rebooting");
                self.reboot(actions, 0);
            }
            return;
        }
        if obs.azure_status != AzureStatus::Idle {
            if !self.memory.idle_requested {
                self.memory.idle_requested = true;
                actions.push(ConnectionAction::IdleAzure);
            }
            return;
        }
        self.set_state(ConnectionState::WifiConnecting, now_ms);
    }

    fn update_wifi_connecting(
        &mut self,
        obs: &Observation,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        if obs.wifi_connected {
            self.set_state(ConnectionState::WifiConnected, now_ms);
            return;
        }
        if !self.memory.wifi_connect_requested {
            self.memory.wifi_connect_requested = true;
            actions.push(ConnectionAction::ConnectWifi);
            return;
        }
        if let Some(status) = obs.wifi_connect_failure {
            warn!("wifi connect failed with {status:?}");
            if obs.gatt_running {
                actions.push(ConnectionAction::ReportWifiStatus(
                    WifiConnectionStatus::WifiNotDiscovered,
                ));
                self.set_state(ConnectionState::ActivatingWifiSetup, now_ms);
            } else {
                self.set_state(ConnectionState::NotConnected, now_ms);
            }
        }
    }

    fn update_discovery_connecting(
        &mut self,
        obs: &Observation,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        if !obs.wifi_connected {
            self.set_state(ConnectionState::NotConnected, now_ms);
            return;
        }
        if obs.cloud_paused && !self.memory.unpause_requested {
            self.memory.unpause_requested = true;
            actions.push(ConnectionAction::UnpauseCloud);
        }
        if !obs.discovery_succeeded {
            return;
        }
        // Both checks run; when both hold, the later transition wins.
        if obs.gatt_running {
            self.set_state(ConnectionState::WaitingForBleOff, now_ms);
        }
        if obs.health == FULL_HEALTH {
            self.set_state(ConnectionState::DiscoveryConnected, now_ms);
        }
    }

    fn update_iot_hub_connecting(
        &mut self,
        obs: &Observation,
        inbox: &mut dyn ControllerInbox,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        if self.elapsed_ms(now_ms) > self.config.iot_hub_connect_timeout_ms {
            error!("iot hub connection timed out, rebooting");
            self.reboot(actions, 0);
            return;
        }
        if !obs.wifi_connected {
            self.set_state(ConnectionState::NotConnected, now_ms);
            return;
        }
        if let Some(strings) = inbox.latest_connection_strings() {
            self.connection_strings = Some(strings);
        }

        match obs.azure_status {
            AzureStatus::Connected => {
                if obs.gatt_running {
                    actions.push(ConnectionAction::ReportWifiStatus(
                        WifiConnectionStatus::IotHubConnected,
                    ));
                }
                self.set_state(ConnectionState::IotHubConnected, now_ms);
            }
            AzureStatus::Connecting => {}
            AzureStatus::Idle | AzureStatus::Error => {
                let Some(strings) = &self.connection_strings else {
                    debug!("waiting for connection strings");
                    return;
                };
                let target = match self.memory.azure_attempts {
                    0 => &strings.primary,
                    1 => &strings.secondary,
                    _ => {
                        if !self.memory.attempts_exhausted_logged {
                            self.memory.attempts_exhausted_logged = true;
                            error!("both iot hub connection strings failed");
                        }
                        return;
                    }
                };
                info!(
                    "connecting to iot hub with {} string",
                    if self.memory.azure_attempts == 0 { "primary" } else { "secondary" }
                );
                actions.push(ConnectionAction::ConnectAzure(target.clone()));
                self.memory.azure_attempts += 1;
            }
        }
    }

    fn update_iot_hub_connected(
        &mut self,
        obs: &Observation,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        if obs.azure_unable_to_send {
            error!("iot hub session cannot send, rebooting");
            self.reboot(actions, 0);
            return;
        }
        if !obs.wifi_connected {
            self.set_state(ConnectionState::NotConnected, now_ms);
            return;
        }
        if obs.health < FULL_HEALTH {
            warn!("cloud health dropped to {}, reconnecting", obs.health);
            actions.push(ConnectionAction::IdleAzure);
            actions.push(ConnectionAction::PauseCloud);
            self.set_state(ConnectionState::DiscoveryConnecting, now_ms);
            return;
        }
        if obs.azure_status != AzureStatus::Connected {
            warn!("iot hub session dropped ({:?})", obs.azure_status);
            self.set_state(ConnectionState::IotHubConnecting, now_ms);
        }
    }

    fn update_activating_wifi_setup(
        &mut self,
        obs: &Observation,
        inbox: &mut dyn ControllerInbox,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        if !self.memory.waiting_for_reconnect
            && self.elapsed_ms(now_ms) > self.config.wifi_setup_timeout_ms
        {
            error!("wifi setup did not complete in time, rebooting");
            self.reboot(actions, 0);
            return;
        }

        if obs.azure_status != AzureStatus::Idle {
            if !self.memory.idle_requested {
                self.memory.idle_requested = true;
                actions.push(ConnectionAction::IdleAzure);
            }
            return;
        }
        if !obs.cloud_paused {
            if !self.memory.pause_requested {
                self.memory.pause_requested = true;
                actions.push(ConnectionAction::PauseCloud);
            }
            return;
        }
        if obs.wifi_connected {
            if !self.memory.disconnect_requested {
                self.memory.disconnect_requested = true;
                actions.push(ConnectionAction::DisconnectWifi);
            }
            return;
        }
        if !obs.gatt_running {
            if !self.memory.gatt_requested {
                self.memory.gatt_requested = true;
                actions.push(ConnectionAction::StartGatt);
            }
            return;
        }

        if !self.memory.waiting_for_reconnect {
            info!("waiting for wifi credentials over ble");
            self.memory.waiting_for_reconnect = true;
            actions.push(ConnectionAction::ReportWifiStatus(WifiConnectionStatus::Idle));
        }
        if let Some(credentials) = inbox.next_reconnect() {
            info!("received credentials for {}", credentials.ssid);
            actions.push(ConnectionAction::ReportWifiStatus(WifiConnectionStatus::Connecting));
            actions.push(ConnectionAction::PersistCredentials(credentials.clone()));
            actions.push(ConnectionAction::ReconfigureWifi(credentials));
            self.set_state(ConnectionState::NotConnected, now_ms);
        }
    }

    fn update_fw_upgrade(
        &mut self,
        obs: &Observation,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        if self.elapsed_ms(now_ms) > self.config.fw_upgrade_timeout_ms {
            error!("firmware upgrade timed out, rebooting");
            self.reboot(actions, 0);
            return;
        }
        match obs.firmware_state {
            FirmwareUpgradeState::NotRequested => {
                if !self.memory.upgrade_started {
                    self.memory.upgrade_started = true;
                    actions.push(ConnectionAction::StartFirmwareUpgrade);
                }
            }
            FirmwareUpgradeState::Started | FirmwareUpgradeState::InProgress => {}
            FirmwareUpgradeState::Completed | FirmwareUpgradeState::Failed => {
                info!("firmware upgrade ended {:?}, rebooting", obs.firmware_state);
                let delay_ms = self.config.reboot_delay_ms;
                self.reboot(actions, delay_ms);
            }
        }
    }

    fn update_factory_reset(
        &mut self,
        obs: &Observation,
        actions: &mut Vec<ConnectionAction>,
        now_ms: u64,
    ) {
        if obs.forget_me != ForgetMeState::ResetConfirmed {
            info!("forget-me withdrawn, cancelling factory reset");
            self.set_state(ConnectionState::NotConnected, now_ms);
            return;
        }

        let step_elapsed = now_ms.saturating_sub(self.memory.reset_step_started_ms);
        match self.memory.reset_step {
            ResetStep::IdleAzure => {
                if obs.azure_status == AzureStatus::Idle {
                    self.next_reset_step(ResetStep::PauseCloud, now_ms);
                } else if step_elapsed > self.config.reset_azure_idle_budget_ms {
                    warn!("iot hub session did not idle, continuing reset");
                    self.next_reset_step(ResetStep::PauseCloud, now_ms);
                } else if !self.memory.idle_requested {
                    self.memory.idle_requested = true;
                    actions.push(ConnectionAction::IdleAzure);
                }
            }
            ResetStep::PauseCloud => {
                if obs.cloud_paused {
                    self.next_reset_step(ResetStep::DisconnectWifi, now_ms);
                } else if step_elapsed > self.config.reset_cloud_pause_budget_ms {
                    warn!("cloud service did not pause, continuing reset");
                    self.next_reset_step(ResetStep::DisconnectWifi, now_ms);
                } else if !self.memory.pause_requested {
                    self.memory.pause_requested = true;
                    actions.push(ConnectionAction::PauseCloud);
                }
            }
            ResetStep::DisconnectWifi => {
                if !obs.wifi_connected {
                    self.next_reset_step(ResetStep::Reset, now_ms);
                } else if step_elapsed > self.config.reset_wifi_disconnect_budget_ms {
                    warn!("wifi did not disconnect, continuing reset");
                    self.next_reset_step(ResetStep::Reset, now_ms);
                } else if !self.memory.disconnect_requested {
                    self.memory.disconnect_requested = true;
                    actions.push(ConnectionAction::DisconnectWifi);
                }
            }
            ResetStep::Reset => {
                info!("performing factory reset");
                actions.push(ConnectionAction::FactoryReset);
                actions.push(ConnectionAction::RestoreDefaultWifi);
                self.set_state(ConnectionState::NotConnected, now_ms);
            }
        }
    }

    fn next_reset_step(&mut self, step: ResetStep, now_ms: u64) {
        debug!("factory reset step {step:?}");
        self.memory.reset_step = step;
        self.memory.reset_step_started_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Inbox {
        bt_results: VecDeque<WifiConnectionStatus>,
        requests: VecDeque<ConnectionStatusChangeRequest>,
        reconnects: VecDeque<WifiCredentials>,
        strings: Vec<ConnectionStrings>,
    }

    impl ControllerInbox for Inbox {
        fn next_bt_result(&mut self) -> Option<WifiConnectionStatus> {
            self.bt_results.pop_front()
        }

        fn next_status_request(&mut self) -> Option<ConnectionStatusChangeRequest> {
            self.requests.pop_front()
        }

        fn next_reconnect(&mut self) -> Option<WifiCredentials> {
            self.reconnects.pop_front()
        }

        fn latest_connection_strings(&mut self) -> Option<ConnectionStrings> {
            self.strings.drain(..).last()
        }
    }

    fn in_state(state: ConnectionState) -> ConnectionController {
        let mut controller = ConnectionController::new(ConnectionConfig::default(), 0);
        controller.set_state(state, 0);
        controller.state_changed = false;
        controller
    }

    fn online() -> Observation {
        Observation {
            wifi_connected: true,
            cloud_paused: false,
            discovery_succeeded: true,
            health: FULL_HEALTH,
            ..Observation::default()
        }
    }

    fn strings() -> ConnectionStrings {
        ConnectionStrings {
            primary: "primary".to_string(),
            secondary: "secondary".to_string(),
        }
    }

    #[test]
    fn idle_system_starts_connecting_wifi() {
        let mut controller = ConnectionController::new(ConnectionConfig::default(), 0);

        let actions = controller.tick(&Observation::default(), &mut Inbox::default(), 10);

        assert!(actions.is_empty());
        assert_eq!(controller.state(), ConnectionState::WifiConnecting);
        assert_eq!(controller.sleep_period_ms(), 100);
    }

    #[test]
    fn not_connected_shuts_down_cloud_before_wifi() {
        let mut controller = in_state(ConnectionState::NotConnected);
        let mut obs = Observation {
            cloud_paused: false,
            azure_status: AzureStatus::Connected,
            ..Observation::default()
        };

        assert_eq!(
            controller.tick(&obs, &mut Inbox::default(), 1),
            vec![ConnectionAction::PauseCloud]
        );
        assert!(controller.tick(&obs, &mut Inbox::default(), 2).is_empty());

        obs.cloud_paused = true;
        assert_eq!(
            controller.tick(&obs, &mut Inbox::default(), 3),
            vec![ConnectionAction::IdleAzure]
        );
        obs.azure_status = AzureStatus::Idle;
        controller.tick(&obs, &mut Inbox::default(), 4);
        assert_eq!(controller.state(), ConnectionState::WifiConnecting);
    }

    #[test]
    fn stuck_cloud_pause_reboots() {
        let mut controller = in_state(ConnectionState::NotConnected);
        let obs = Observation {
            cloud_paused: false,
            ..Observation::default()
        };
        controller.tick(&obs, &mut Inbox::default(), 1);

        let actions = controller.tick(&obs, &mut Inbox::default(), 120_001);

        assert_eq!(actions, vec![ConnectionAction::Reboot { delay_ms: 0 }]);
        assert!(controller.tick(&obs, &mut Inbox::default(), 120_002).is_empty());
    }

    #[test]
    fn wifi_failure_with_ble_active_returns_to_setup() {
        let mut controller = in_state(ConnectionState::WifiConnecting);
        let mut obs = Observation {
            gatt_running: true,
            ..Observation::default()
        };
        assert_eq!(
            controller.tick(&obs, &mut Inbox::default(), 1),
            vec![ConnectionAction::ConnectWifi]
        );

        obs.wifi_connect_failure = Some(WifiConnectionStatus::WrongPassword);
        let actions = controller.tick(&obs, &mut Inbox::default(), 2);

        assert_eq!(
            actions,
            vec![ConnectionAction::ReportWifiStatus(WifiConnectionStatus::WifiNotDiscovered)]
        );
        assert_eq!(controller.state(), ConnectionState::ActivatingWifiSetup);
    }

    #[test]
    fn discovery_prefers_connected_when_ble_also_active() {
        let mut controller = in_state(ConnectionState::DiscoveryConnecting);
        let obs = Observation {
            gatt_running: true,
            ..online()
        };

        controller.tick(&obs, &mut Inbox::default(), 1);

        assert_eq!(controller.state(), ConnectionState::DiscoveryConnected);
    }

    #[test]
    fn discovery_waits_for_ble_off_until_healthy() {
        let mut controller = in_state(ConnectionState::DiscoveryConnecting);
        let obs = Observation {
            gatt_running: true,
            health: 0,
            ..online()
        };

        controller.tick(&obs, &mut Inbox::default(), 1);

        assert_eq!(controller.state(), ConnectionState::WaitingForBleOff);
    }

    #[test]
    fn discovery_unpauses_cloud_once() {
        let mut controller = in_state(ConnectionState::DiscoveryConnecting);
        let obs = Observation {
            cloud_paused: true,
            discovery_succeeded: false,
            ..online()
        };

        assert_eq!(
            controller.tick(&obs, &mut Inbox::default(), 1),
            vec![ConnectionAction::UnpauseCloud]
        );
        assert!(controller.tick(&obs, &mut Inbox::default(), 2).is_empty());
    }

    #[test]
    fn iot_hub_tries_primary_then_secondary_only() {
        let mut controller = in_state(ConnectionState::IotHubConnecting);
        let mut inbox = Inbox {
            strings: vec![strings()],
            ..Inbox::default()
        };
        let mut obs = Observation {
            azure_status: AzureStatus::Idle,
            ..online()
        };

        assert_eq!(
            controller.tick(&obs, &mut inbox, 1),
            vec![ConnectionAction::ConnectAzure("primary".to_string())]
        );

        obs.azure_status = AzureStatus::Error;
        assert_eq!(
            controller.tick(&obs, &mut inbox, 2),
            vec![ConnectionAction::ConnectAzure("secondary".to_string())]
        );

        assert!(controller.tick(&obs, &mut inbox, 3).is_empty());
        assert_eq!(controller.state(), ConnectionState::IotHubConnecting);
    }

    #[test]
    fn iot_hub_connect_timeout_reboots() {
        let mut controller = in_state(ConnectionState::IotHubConnecting);
        let obs = Observation {
            azure_status: AzureStatus::Connecting,
            ..online()
        };

        let actions = controller.tick(&obs, &mut Inbox::default(), 300_001);

        assert_eq!(actions, vec![ConnectionAction::Reboot { delay_ms: 0 }]);
        assert!(controller.is_rebooting());
    }

    #[test]
    fn health_drop_restarts_discovery() {
        let mut controller = in_state(ConnectionState::IotHubConnected);
        let obs = Observation {
            azure_status: AzureStatus::Connected,
            health: 20,
            ..online()
        };

        let actions = controller.tick(&obs, &mut Inbox::default(), 1);

        assert_eq!(
            actions,
            vec![ConnectionAction::IdleAzure, ConnectionAction::PauseCloud]
        );
        assert_eq!(controller.state(), ConnectionState::DiscoveryConnecting);
    }

    #[test]
    fn unable_to_send_reboots() {
        let mut controller = in_state(ConnectionState::IotHubConnected);
        let obs = Observation {
            azure_status: AzureStatus::Connected,
            azure_unable_to_send: true,
            ..online()
        };

        assert_eq!(
            controller.tick(&obs, &mut Inbox::default(), 1),
            vec![ConnectionAction::Reboot { delay_ms: 0 }]
        );
    }

    #[test]
    fn wifi_setup_walks_precondition_chain() {
        let mut controller = in_state(ConnectionState::ActivatingWifiSetup);
        let mut inbox = Inbox::default();
        let mut obs = Observation {
            azure_status: AzureStatus::Connected,
            ..online()
        };

        assert_eq!(controller.tick(&obs, &mut inbox, 1), vec![ConnectionAction::IdleAzure]);
        obs.azure_status = AzureStatus::Idle;
        assert_eq!(controller.tick(&obs, &mut inbox, 2), vec![ConnectionAction::PauseCloud]);
        obs.cloud_paused = true;
        assert_eq!(controller.tick(&obs, &mut inbox, 3), vec![ConnectionAction::DisconnectWifi]);
        obs.wifi_connected = false;
        assert_eq!(controller.tick(&obs, &mut inbox, 4), vec![ConnectionAction::StartGatt]);
        obs.gatt_running = true;
        assert_eq!(
            controller.tick(&obs, &mut inbox, 5),
            vec![ConnectionAction::ReportWifiStatus(WifiConnectionStatus::Idle)]
        );

        // No timeout while waiting for credentials.
        assert!(controller.tick(&obs, &mut inbox, 10_000_000).is_empty());

        let credentials = WifiCredentials {
            ssid: "home".to_string(),
            password: "secret".to_string(),
            static_ip: None,
        };
        inbox.reconnects.push_back(credentials.clone());
        let actions = controller.tick(&obs, &mut inbox, 10_000_001);

        assert_eq!(
            actions,
            vec![
                ConnectionAction::ReportWifiStatus(WifiConnectionStatus::Connecting),
                ConnectionAction::PersistCredentials(credentials.clone()),
                ConnectionAction::ReconfigureWifi(credentials),
            ]
        );
        assert_eq!(controller.state(), ConnectionState::NotConnected);
    }

    #[test]
    fn wifi_setup_times_out_before_waiting() {
        let mut controller = in_state(ConnectionState::ActivatingWifiSetup);
        let obs = Observation {
            azure_status: AzureStatus::Connecting,
            ..Observation::default()
        };

        let actions = controller.tick(&obs, &mut Inbox::default(), 600_001);

        assert_eq!(actions, vec![ConnectionAction::Reboot { delay_ms: 0 }]);
    }

    #[test]
    fn bluetooth_requests_drive_setup() {
        let mut controller = in_state(ConnectionState::IotHubConnected);
        let mut inbox = Inbox::default();
        inbox.requests.push_back(ConnectionStatusChangeRequest::BluetoothOn);

        controller.tick(&online(), &mut inbox, 1);
        assert_eq!(controller.state(), ConnectionState::ActivatingWifiSetup);

        inbox.requests.push_back(ConnectionStatusChangeRequest::BluetoothOff);
        let actions = controller.tick(&online(), &mut inbox, 2);
        assert_eq!(actions, vec![ConnectionAction::StopGatt]);
        assert_eq!(controller.state(), ConnectionState::NotConnected);
    }

    #[test]
    fn failed_bt_result_reenters_setup_only_with_gatt() {
        let mut controller = in_state(ConnectionState::DiscoveryConnecting);
        let mut inbox = Inbox::default();
        let status = WifiConnectionStatus::DiscoverySendFailed;

        inbox.bt_results.push_back(status);
        let obs = Observation {
            discovery_succeeded: false,
            ..online()
        };
        assert_eq!(
            controller.tick(&obs, &mut inbox, 1),
            vec![ConnectionAction::ReportWifiStatus(status)]
        );
        assert_eq!(controller.state(), ConnectionState::DiscoveryConnecting);

        inbox.bt_results.push_back(status);
        let obs = Observation {
            gatt_running: true,
            ..obs
        };
        controller.tick(&obs, &mut inbox, 2);
        assert_eq!(controller.state(), ConnectionState::ActivatingWifiSetup);
    }

    #[test]
    fn firmware_upgrade_reboots_after_terminal_state() {
        let mut controller = in_state(ConnectionState::IotHubConnected);
        let mut inbox = Inbox::default();
        inbox.requests.push_back(ConnectionStatusChangeRequest::FwUpgradeReady);
        let mut obs = Observation {
            azure_status: AzureStatus::Connected,
            ..online()
        };

        controller.tick(&obs, &mut inbox, 1);
        assert_eq!(controller.state(), ConnectionState::FwUpgradeInProgress);
        assert_eq!(
            controller.tick(&obs, &mut inbox, 2),
            vec![ConnectionAction::StartFirmwareUpgrade]
        );

        obs.firmware_state = FirmwareUpgradeState::InProgress;
        assert!(controller.tick(&obs, &mut inbox, 3).is_empty());

        obs.firmware_state = FirmwareUpgradeState::Failed;
        assert_eq!(
            controller.tick(&obs, &mut inbox, 4),
            vec![ConnectionAction::Reboot { delay_ms: 3_000 }]
        );
    }

    #[test]
    fn confirmed_forget_me_runs_ordered_reset() {
        let mut controller = in_state(ConnectionState::IotHubConnected);
        let mut inbox = Inbox::default();
        let mut obs = Observation {
            forget_me: ForgetMeState::ResetConfirmed,
            azure_status: AzureStatus::Connected,
            ..online()
        };

        assert!(controller.tick(&obs, &mut inbox, 1).is_empty());
        assert_eq!(controller.state(), ConnectionState::FactoryReset);

        assert_eq!(controller.tick(&obs, &mut inbox, 2), vec![ConnectionAction::IdleAzure]);
        obs.azure_status = AzureStatus::Idle;
        controller.tick(&obs, &mut inbox, 3);
        assert_eq!(controller.tick(&obs, &mut inbox, 4), vec![ConnectionAction::PauseCloud]);

        // Cloud never pauses; the budget runs out and the reset proceeds.
        controller.tick(&obs, &mut inbox, 60_010);
        assert_eq!(
            controller.tick(&obs, &mut inbox, 60_011),
            vec![ConnectionAction::DisconnectWifi]
        );
        obs.wifi_connected = false;
        controller.tick(&obs, &mut inbox, 60_012);

        assert_eq!(
            controller.tick(&obs, &mut inbox, 60_013),
            vec![ConnectionAction::FactoryReset, ConnectionAction::RestoreDefaultWifi]
        );
        assert_eq!(controller.state(), ConnectionState::NotConnected);
    }

    #[test]
    fn bluetooth_request_does_not_interrupt_reset() {
        let mut controller = in_state(ConnectionState::IotHubConnected);
        let mut inbox = Inbox::default();
        let obs = Observation {
            forget_me: ForgetMeState::ResetConfirmed,
            azure_status: AzureStatus::Connected,
            ..online()
        };

        controller.tick(&obs, &mut inbox, 1);
        assert_eq!(controller.tick(&obs, &mut inbox, 2), vec![ConnectionAction::IdleAzure]);

        inbox.requests.push_back(ConnectionStatusChangeRequest::BluetoothOn);
        assert!(controller.tick(&obs, &mut inbox, 3).is_empty());
        assert_eq!(controller.state(), ConnectionState::FactoryReset);
    }

    #[test]
    fn withdrawn_forget_me_cancels_reset() {
        let mut controller = in_state(ConnectionState::FactoryReset);

        controller.tick(&Observation::default(), &mut Inbox::default(), 1);

        assert_eq!(controller.state(), ConnectionState::NotConnected);
    }
}
