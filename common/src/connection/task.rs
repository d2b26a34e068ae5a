//! Runs the connection state machine against real collaborators.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::cloud::{CloudService, ConnectionStrings};
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionAction, ConnectionController, ControllerInbox, Observation};
use crate::queue::Queue;
use crate::settings::Settings;
use crate::time::SystemClock;
use crate::types::{
    AzureStatus, ConnectionState, ConnectionStatusChangeRequest, FirmwareUpgradeState,
    WifiConnectionStatus, WifiCredentials,
};
use crate::upgrade::{FirmwareDownloader, FirmwareUpgradeController};

pub trait WifiControl: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Blocks until associated or failed.
    fn connect(&self) -> Result<(), WifiConnectionStatus>;
    fn disconnect(&self);
    fn reconfigure(&self, credentials: &WifiCredentials);
}

/// BLE GATT service used for Wi-Fi provisioning.
pub trait BleProvisioning: Send + Sync {
    fn is_gatt_running(&self) -> bool;
    fn start_gatt(&self) -> bool;
    fn stop_gatt(&self);
    fn report_status(&self, status: WifiConnectionStatus);
}

/// IoT-Hub session driver.
pub trait AzureSession: Send + Sync {
    fn status(&self) -> AzureStatus;
    fn connect(&self, connection_string: &str);
    fn idle(&self);
    fn is_unable_to_send(&self) -> bool;
}

pub trait CloudControl: Send + Sync {
    fn is_paused(&self) -> bool;
    fn discovery_succeeded(&self) -> bool;
    fn health(&self) -> u8;
    fn request_pause(&self);
    fn request_unpause(&self);
}

impl CloudControl for CloudService {
    fn is_paused(&self) -> bool {
        CloudService::is_paused(self)
    }

    fn discovery_succeeded(&self) -> bool {
        CloudService::discovery_succeeded(self)
    }

    fn health(&self) -> u8 {
        CloudService::health(self)
    }

    fn request_pause(&self) {
        CloudService::request_pause(self)
    }

    fn request_unpause(&self) {
        CloudService::request_unpause(self)
    }
}

pub trait FirmwareUpgradeRunner: Send + Sync {
    fn state(&self) -> FirmwareUpgradeState;
    fn start(&self);
}

/// Starts upgrades on their own thread.
pub struct SpawnedUpgrade {
    pub controller: Arc<FirmwareUpgradeController>,
    pub downloader: Arc<dyn FirmwareDownloader>,
}

impl FirmwareUpgradeRunner for SpawnedUpgrade {
    fn state(&self) -> FirmwareUpgradeState {
        self.controller.state()
    }

    fn start(&self) {
        if let Err(err) = self.controller.spawn(Arc::clone(&self.downloader)) {
            warn!("cannot start firmware upgrade thread: {err}");
        }
    }
}

pub trait SystemControl: Send + Sync {
    /// Restarts after `delay_ms`. Need not return.
    fn reboot(&self, delay_ms: u64);
}

/// Lock-free view of the current state for other tasks.
#[derive(Debug)]
pub struct ConnectionStateView(AtomicU8);

impl Default for ConnectionStateView {
    fn default() -> Self {
        Self(AtomicU8::new(ConnectionState::NotConnected.index()))
    }
}

impl ConnectionStateView {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_index(self.0.load(Ordering::Relaxed))
            .unwrap_or(ConnectionState::NotConnected)
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state.index(), Ordering::Relaxed);
    }
}

/// Everything the controller task talks to.
pub struct ConnectionPeers {
    pub wifi: Arc<dyn WifiControl>,
    pub ble: Arc<dyn BleProvisioning>,
    pub azure: Arc<dyn AzureSession>,
    pub cloud: Arc<dyn CloudControl>,
    pub firmware: Arc<dyn FirmwareUpgradeRunner>,
    pub system: Arc<dyn SystemControl>,
    pub settings: Arc<dyn Settings>,
    pub clock: Arc<dyn SystemClock>,
    pub bt_results: Arc<Queue<WifiConnectionStatus>>,
    pub status_requests: Arc<Queue<ConnectionStatusChangeRequest>>,
    pub reconnects: Arc<Queue<WifiCredentials>>,
    pub connection_strings: Arc<Queue<ConnectionStrings>>,
}

struct QueueInbox<'a> {
    peers: &'a ConnectionPeers,
}

impl ControllerInbox for QueueInbox<'_> {
    fn next_bt_result(&mut self) -> Option<WifiConnectionStatus> {
        self.peers.bt_results.try_pop()
    }

    fn next_status_request(&mut self) -> Option<ConnectionStatusChangeRequest> {
        self.peers.status_requests.try_pop()
    }

    fn next_reconnect(&mut self) -> Option<WifiCredentials> {
        self.peers.reconnects.try_pop()
    }

    fn latest_connection_strings(&mut self) -> Option<ConnectionStrings> {
        std::iter::from_fn(|| self.peers.connection_strings.try_pop()).last()
    }
}

pub struct ConnectionControllerTask {
    controller: ConnectionController,
    peers: ConnectionPeers,
    default_wifi: WifiCredentials,
    wifi_failure: Option<WifiConnectionStatus>,
    view: Arc<ConnectionStateView>,
}

impl ConnectionControllerTask {
    pub fn new(config: ConnectionConfig, default_wifi: WifiCredentials, peers: ConnectionPeers) -> Self {
        let controller = ConnectionController::new(config, peers.clock.uptime_ms());
        Self {
            controller,
            peers,
            default_wifi,
            wifi_failure: None,
            view: Arc::new(ConnectionStateView::default()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn state_view(&self) -> Arc<ConnectionStateView> {
        Arc::clone(&self.view)
    }

    /// One iteration when `eternal` is false; otherwise loops forever,
    /// sleeping between iterations.
    pub fn run(&mut self, eternal: bool) {
        loop {
            self.run_once();
            if !eternal {
                return;
            }
            std::thread::sleep(Duration::from_millis(self.controller.sleep_period_ms()));
        }
    }

    fn observe(&mut self) -> Observation {
        let peers = &self.peers;
        Observation {
            wifi_connected: peers.wifi.is_connected(),
            wifi_connect_failure: self.wifi_failure.take(),
            cloud_paused: peers.cloud.is_paused(),
            discovery_succeeded: peers.cloud.discovery_succeeded(),
            health: peers.cloud.health(),
            azure_status: peers.azure.status(),
            azure_unable_to_send: peers.azure.is_unable_to_send(),
            gatt_running: peers.ble.is_gatt_running(),
            forget_me: peers.settings.forget_me(),
            firmware_state: peers.firmware.state(),
        }
    }

    fn run_once(&mut self) {
        let obs = self.observe();
        let now_ms = self.peers.clock.uptime_ms();
        let actions = {
            let mut inbox = QueueInbox { peers: &self.peers };
            self.controller.tick(&obs, &mut inbox, now_ms)
        };
        for action in actions {
            self.perform(action);
        }
        self.view.set(self.controller.state());
    }

    fn perform(&mut self, action: ConnectionAction) {
        debug!("performing {action:?}");
        let peers = &self.peers;
        match action {
            ConnectionAction::ConnectWifi => {
                if let Err(status) = peers.wifi.connect() {
                    self.wifi_failure = Some(status);
                }
            }
            ConnectionAction::DisconnectWifi => peers.wifi.disconnect(),
            ConnectionAction::ReconfigureWifi(credentials) => peers.wifi.reconfigure(&credentials),
            ConnectionAction::RestoreDefaultWifi => {
                peers.settings.set_wifi_credentials(self.default_wifi.clone());
                peers.wifi.reconfigure(&self.default_wifi);
            }
            ConnectionAction::PauseCloud => peers.cloud.request_pause(),
            ConnectionAction::UnpauseCloud => peers.cloud.request_unpause(),
            ConnectionAction::IdleAzure => peers.azure.idle(),
            ConnectionAction::ConnectAzure(connection_string) => {
                peers.azure.connect(&connection_string)
            }
            ConnectionAction::StartGatt => {
                if !peers.ble.start_gatt() {
                    warn!("ble provisioning service failed to start");
                }
            }
            ConnectionAction::StopGatt => peers.ble.stop_gatt(),
            ConnectionAction::ReportWifiStatus(status) => peers.ble.report_status(status),
            ConnectionAction::PersistCredentials(credentials) => {
                peers.settings.set_wifi_credentials(credentials)
            }
            ConnectionAction::StartFirmwareUpgrade => peers.firmware.start(),
            ConnectionAction::FactoryReset => peers.settings.factory_reset(),
            ConnectionAction::Reboot { delay_ms } => {
                info!("rebooting in {delay_ms} ms");
                peers.system.reboot(delay_ms);
            }
        }
    }
}
