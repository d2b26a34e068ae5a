//! Service graph shared by the host and ESP32 builds.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use appliance_common::cloud::{
    CloudService, ConnectionStrings, DiscoveryService, HealthCheckService, HttpClient, TimeSource,
};
use appliance_common::connection::task::{
    AzureSession, BleProvisioning, ConnectionPeers, ConnectionStateView, SpawnedUpgrade,
    SystemControl, WifiControl,
};
use appliance_common::connection::ConnectionControllerTask;
use appliance_common::frame::FrameBuilderUser;
use appliance_common::iothub::{DeviceMethodHandler, SessionStatus};
use appliance_common::payload::{AzureSyncController, SyncCache};
use appliance_common::protocol::transfer::TransferFrameResponse;
use appliance_common::queue::{EventFlag, Queue};
use appliance_common::settings::{DeviceMeta, MemorySettings, Settings};
use appliance_common::time::SystemClock;
use appliance_common::types::{
    AzureStatus, ConnectionState, ConnectionStatusChangeRequest, ControllerStatus,
    WifiConnectionStatus, WifiCredentials,
};
use appliance_common::upgrade::{FirmwareDownloader, FirmwareUpgradeController};
use appliance_common::RuntimeConfig;

const OUTBOX_DEPTH: usize = 8;
const STATUS_REQUEST_DEPTH: usize = 4;
const OUTBOX_POLL_MS: u64 = 500;

/// Publishes device-to-cloud messages on the open IoT-Hub session.
pub trait TelemetryPublisher: Send + Sync {
    fn publish_telemetry(&self, body: &[u8]) -> bool;
}

/// Platform drivers handed to [`Appliance::start`].
pub struct Drivers {
    pub wifi: Arc<dyn WifiControl>,
    pub ble: Arc<dyn BleProvisioning>,
    pub azure: Arc<dyn AzureSession>,
    pub telemetry: Arc<dyn TelemetryPublisher>,
    pub system: Arc<dyn SystemControl>,
    pub downloader: Arc<dyn FirmwareDownloader>,
}

pub struct Appliance {
    pub config: RuntimeConfig,
    pub device: Arc<DeviceMeta>,
    pub settings: Arc<MemorySettings>,
    pub clock: Arc<dyn SystemClock>,
    pub cloud: Arc<CloudService>,
    pub upgrade: Arc<FirmwareUpgradeController>,
    pub methods: Arc<DeviceMethodHandler>,
    pub session: Arc<SessionStatus>,
    pub outbox: Arc<Queue<FrameBuilderUser>>,
    pub status_requests: Arc<Queue<ConnectionStatusChangeRequest>>,
    pub reconnects: Arc<Queue<WifiCredentials>>,
    sync: Arc<SyncCache>,
    bt_results: Arc<Queue<WifiConnectionStatus>>,
    connection_strings: Arc<Queue<ConnectionStrings>>,
}

impl Appliance {
    pub fn new(
        config: RuntimeConfig,
        clock: Arc<dyn SystemClock>,
        http: Arc<dyn HttpClient>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let device = Arc::new(DeviceMeta::new(&config.device));
        let settings = Arc::new(MemorySettings::new(
            config.settings.clone(),
            config.network.wifi.clone(),
        ));

        let bt_results = Arc::new(Queue::new(1));
        let connection_strings = Arc::new(Queue::new(1));
        let status_requests = Arc::new(Queue::new(STATUS_REQUEST_DEPTH));
        let reconnects = Arc::new(Queue::new(1));
        let outbox = Arc::new(Queue::new(OUTBOX_DEPTH));

        let discovery = DiscoveryService::new(
            Arc::clone(&http),
            Arc::clone(&device),
            config.cloud.discovery_url.clone(),
            Arc::clone(&bt_results),
            Arc::clone(&connection_strings),
        );
        let health_check = HealthCheckService::new(
            http,
            Arc::clone(&device),
            settings.clone(),
            Arc::clone(&clock),
            config.cloud.health_check_url.clone(),
            Arc::new(EventFlag::new()),
        );
        let cloud = Arc::new(CloudService::new(
            config.cloud.clone(),
            discovery,
            health_check,
            time_source,
            settings.clone(),
            Arc::clone(&clock),
        ));

        let upgrade = Arc::new(FirmwareUpgradeController::new(
            settings.clone(),
            Arc::clone(&status_requests),
            Arc::clone(&outbox),
        ));
        let sync = Arc::new(SyncCache::new());
        let methods = Arc::new(DeviceMethodHandler {
            settings: settings.clone(),
            device: Arc::clone(&device),
            clock: Arc::clone(&clock),
            sync: Arc::clone(&sync),
            firmware: upgrade.clone(),
        });

        Self {
            config,
            device,
            settings,
            clock,
            cloud,
            upgrade,
            methods,
            session: Arc::new(SessionStatus::new()),
            outbox,
            status_requests,
            reconnects,
            sync,
            bt_results,
            connection_strings,
        }
    }

    /// Starts the cloud service, connection controller, cloud sync and
    /// telemetry threads.
    pub fn start(&self, drivers: Drivers) -> anyhow::Result<Arc<ConnectionStateView>> {
        let cloud = Arc::clone(&self.cloud);
        thread::Builder::new()
            .name("cloud-service".into())
            .stack_size(16 * 1024)
            .spawn(move || cloud.run(true))
            .context("failed to spawn cloud service thread")?;

        let peers = ConnectionPeers {
            wifi: drivers.wifi,
            ble: drivers.ble,
            azure: drivers.azure,
            cloud: self.cloud.clone(),
            firmware: Arc::new(SpawnedUpgrade {
                controller: Arc::clone(&self.upgrade),
                downloader: drivers.downloader,
            }),
            system: drivers.system,
            settings: self.settings.clone(),
            clock: Arc::clone(&self.clock),
            bt_results: Arc::clone(&self.bt_results),
            status_requests: Arc::clone(&self.status_requests),
            reconnects: Arc::clone(&self.reconnects),
            connection_strings: Arc::clone(&self.connection_strings),
        };
        let mut task = ConnectionControllerTask::new(
            self.config.connection.clone(),
            self.config.network.default_wifi.clone(),
            peers,
        );
        let view = task.state_view();
        thread::Builder::new()
            .name("connection".into())
            .stack_size(12 * 1024)
            .spawn(move || task.run(true))
            .context("failed to spawn connection controller thread")?;

        let mut sync =
            AzureSyncController::new(self.settings.clone(), Arc::clone(&self.sync), Arc::clone(&self.outbox));
        let session = Arc::clone(&self.session);
        let period = Duration::from_millis(self.config.connection.loop_period_ms);
        thread::Builder::new()
            .name("azure-sync".into())
            .stack_size(8 * 1024)
            .spawn(move || loop {
                sync.tick(session.get() == AzureStatus::Connected);
                thread::sleep(period);
            })
            .context("failed to spawn cloud sync thread")?;

        let outbox = Arc::clone(&self.outbox);
        let session = Arc::clone(&self.session);
        let telemetry = drivers.telemetry;
        thread::Builder::new()
            .name("telemetry".into())
            .stack_size(8 * 1024)
            .spawn(move || pump_outbox(&outbox, &session, telemetry.as_ref()))
            .context("failed to spawn telemetry thread")?;

        Ok(view)
    }

    pub fn status(&self, state: ConnectionState) -> ControllerStatus {
        let settings = self.settings.as_ref();
        ControllerStatus {
            connection_state: state.as_str(),
            cloud_paused: self.cloud.is_paused(),
            discovery_succeeded: self.cloud.discovery_succeeded(),
            health: self.cloud.health(),
            azure_status: self.session.get(),
            comfort_setpoint: settings.comfort_setpoint().celsius(),
            eco_setpoint: settings.eco_setpoint().celsius(),
            heating_mode: settings.heating_mode().as_str(),
            override_: settings.active_override(),
            button_lock: settings.button_lock(),
            forget_me: settings.forget_me(),
        }
    }
}

/// Frames stay queued while the session is down.
fn pump_outbox(
    outbox: &Queue<FrameBuilderUser>,
    session: &SessionStatus,
    telemetry: &dyn TelemetryPublisher,
) {
    let poll = Duration::from_millis(OUTBOX_POLL_MS);
    loop {
        if session.get() != AzureStatus::Connected {
            thread::sleep(poll);
            continue;
        }
        let Some(frame) = outbox.pop(poll) else {
            continue;
        };
        // Empty or oversized frames are dropped.
        if let Ok(envelope) = TransferFrameResponse::from_frame(&frame) {
            session.record_send(telemetry.publish_telemetry(&envelope.to_json()));
        }
    }
}
