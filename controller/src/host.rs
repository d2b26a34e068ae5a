use std::{
    io::{ErrorKind, Read},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, runtime::Handle, sync::Mutex, task::JoinHandle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use appliance_common::{
    cloud::{HttpClient, TimeSource},
    connection::task::{
        AzureSession, BleProvisioning, ConnectionStateView, SystemControl, WifiControl,
    },
    error::HttpError,
    iothub::{DeviceMethodHandler, IotHubConnection, SessionStatus, METHOD_REQUEST_FILTER, SAS_TOKEN_TTL_SECS},
    payload::azure::TRANSFER_FRAME_METHOD,
    protocol::FirmwareFailureReason,
    types::{
        AzureStatus, ConnectionStatusChangeRequest, ControllerStatus, FirmwareUpgradeState,
        ForgetMeState, WifiConnectionStatus, WifiCredentials,
    },
    upgrade::FirmwareDownloader,
    AdjustableClock, RuntimeConfig, Settings, SystemClock,
};

use crate::runtime::{Appliance, Drivers, TelemetryPublisher};

const MAX_HTTP_BODY: usize = 4096;
const MAX_FIRMWARE_BYTES: usize = 4 * 1024 * 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;
const MQTT_KEEP_ALIVE_SECS: u64 = 60;
const SETTINGS_SAVE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AppState {
    appliance: Arc<Appliance>,
    connection: Arc<ConnectionStateView>,
    wifi: Arc<SimulatedWifi>,
    ble: Arc<SimulatedBle>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    firmware_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    controller: ControllerStatus,
    gdid: String,
    #[serde(rename = "firmwareVersion")]
    firmware_version: String,
    #[serde(rename = "wifiConnected")]
    wifi_connected: bool,
    #[serde(rename = "provisioningActive")]
    provisioning_active: bool,
    #[serde(rename = "provisioningStatus")]
    provisioning_status: Option<WifiConnectionStatus>,
}

#[derive(Debug, Deserialize)]
struct CredentialsUpdate {
    ssid: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    state: FirmwareUpgradeState,
    blocked: bool,
    #[serde(rename = "failureCount")]
    failure_count: u8,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    info!(
        "appliance {} running firmware {}",
        runtime.device.gdid, runtime.device.firmware_version
    );

    let clock: Arc<dyn SystemClock> = Arc::new(AdjustableClock::new());
    let http = Arc::new(UreqHttpClient::new(Duration::from_millis(
        runtime.cloud.http_timeout_ms,
    )));
    let appliance = Arc::new(Appliance::new(
        runtime.clone(),
        clock,
        http,
        Arc::new(HostTimeSource),
    ));

    let wifi = Arc::new(SimulatedWifi::new(runtime.network.wifi.clone()));
    let ble = Arc::new(SimulatedBle::default());
    let session = Arc::new(MqttSession {
        runtime: Handle::current(),
        appliance: Arc::clone(&appliance),
        host_override: std::env::var("IOT_HUB_HOST").ok(),
        port: runtime.network.iot_hub_port,
        active: StdMutex::new(None),
    });

    let connection = appliance.start(Drivers {
        wifi: wifi.clone(),
        ble: ble.clone(),
        azure: session.clone(),
        telemetry: session,
        system: Arc::new(HostSystem),
        downloader: Arc::new(HostDownloader::new(store.firmware_path.as_ref().clone())),
    })?;

    spawn_settings_persistence(Arc::clone(&appliance), store.clone(), runtime);

    let app_state = AppState {
        appliance,
        connection,
        wifi,
        ble,
    };

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/ble/on", post(handle_ble_on))
        .route("/api/ble/off", post(handle_ble_off))
        .route("/api/ble/credentials", post(handle_ble_credentials))
        .route("/api/wifi/drop", post(handle_wifi_drop))
        .route("/api/forget-me", post(handle_forget_me))
        .route("/api/transfer-frame", post(handle_transfer_frame))
        .route("/api/ota/status", get(handle_get_ota_status))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(url) = std::env::var("APPLIANCE_DISCOVERY_URL") {
        runtime.cloud.discovery_url = url;
    }
    if let Ok(url) = std::env::var("APPLIANCE_HEALTH_CHECK_URL") {
        runtime.cloud.health_check_url = url;
    }
    if let Some(port) = std::env::var("IOT_HUB_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.iot_hub_port = port;
    }
}

fn spawn_settings_persistence(appliance: Arc<Appliance>, store: AppStore, mut runtime: RuntimeConfig) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SETTINGS_SAVE_PERIOD);
        let mut pending = false;

        loop {
            interval.tick().await;
            pending |= appliance.settings.take_dirty();
            if !pending {
                continue;
            }

            let (settings, wifi) = appliance.settings.snapshot();
            runtime.settings = settings;
            runtime.network.wifi = wifi;
            match store.save_runtime_config(&runtime).await {
                Ok(()) => pending = false,
                Err(err) => warn!("failed to persist settings: {err:#}"),
            }
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let appliance = &state.appliance;
    Json(StatusView {
        controller: appliance.status(state.connection.get()),
        gdid: appliance.device.gdid().to_string(),
        firmware_version: appliance.device.firmware_version().to_string(),
        wifi_connected: state.wifi.is_connected(),
        provisioning_active: state.ble.is_gatt_running(),
        provisioning_status: state.ble.last_status(),
    })
}

async fn handle_ble_on(State(state): State<AppState>) -> impl IntoResponse {
    request_status_change(&state, ConnectionStatusChangeRequest::BluetoothOn)
}

async fn handle_ble_off(State(state): State<AppState>) -> impl IntoResponse {
    request_status_change(&state, ConnectionStatusChangeRequest::BluetoothOff)
}

fn request_status_change(
    state: &AppState,
    request: ConnectionStatusChangeRequest,
) -> axum::response::Response {
    if !state.appliance.status_requests.push(request) {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "connection controller is busy",
        );
    }
    StatusCode::ACCEPTED.into_response()
}

async fn handle_ble_credentials(
    State(state): State<AppState>,
    Json(update): Json<CredentialsUpdate>,
) -> impl IntoResponse {
    if !state.ble.is_gatt_running() {
        return error_response(StatusCode::CONFLICT, "provisioning is not active");
    }
    let ssid = update.ssid.trim();
    if ssid.is_empty() || ssid.len() > 32 {
        return error_response(StatusCode::BAD_REQUEST, "ssid must be 1-32 characters");
    }
    if update.password.len() > 64 {
        return error_response(StatusCode::BAD_REQUEST, "password must be at most 64 characters");
    }

    state.appliance.reconnects.replace(WifiCredentials {
        ssid: ssid.to_string(),
        password: update.password,
        static_ip: None,
    });
    StatusCode::ACCEPTED.into_response()
}

async fn handle_wifi_drop(State(state): State<AppState>) -> impl IntoResponse {
    warn!("simulating wifi link loss");
    state.wifi.disconnect();
    StatusCode::NO_CONTENT
}

async fn handle_forget_me(State(state): State<AppState>) -> impl IntoResponse {
    state.appliance.settings.set_forget_me(ForgetMeState::Requested);
    StatusCode::ACCEPTED
}

async fn handle_transfer_frame(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let (status, body) = state.appliance.methods.invoke(TRANSFER_FRAME_METHOD, &body);
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
}

async fn handle_get_ota_status(State(state): State<AppState>) -> impl IntoResponse {
    let appliance = &state.appliance;
    Json(OtaStatusResponse {
        state: appliance.upgrade.state(),
        blocked: appliance.upgrade.is_blocked(),
        failure_count: appliance.settings.fw_upgrade_failures(),
    })
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("APPLIANCE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            firmware_path: Arc::new(data_dir.join("firmware.bin")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

struct UreqHttpClient {
    agent: ureq::Agent,
}

impl UreqHttpClient {
    fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl HttpClient for UreqHttpClient {
    fn post_json(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, HttpError> {
        let response = self
            .agent
            .post(url)
            .set("Content-Type", "application/json")
            .send_bytes(body)
            .map_err(|err| ureq_error(url, err))?;
        read_limited(response.into_reader(), MAX_HTTP_BODY, url)
    }
}

fn ureq_error(url: &str, err: ureq::Error) -> HttpError {
    match err {
        ureq::Error::Status(code, _) => HttpError::Status(code),
        ureq::Error::Transport(transport) => HttpError::Transport {
            url: url.to_string(),
            reason: transport.to_string(),
        },
    }
}

fn read_limited(reader: impl Read, limit: usize, url: &str) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|err| HttpError::Transport {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
    if body.len() > limit {
        return Err(HttpError::BodyTooLarge(limit));
    }
    Ok(body)
}

/// The host clock is already disciplined by the OS.
struct HostTimeSource;

impl TimeSource for HostTimeSource {
    fn sync_time(&self) -> bool {
        true
    }
}

/// Station link stand-in: joins any non-empty SSID.
struct SimulatedWifi {
    connected: AtomicBool,
    credentials: StdMutex<WifiCredentials>,
}

impl SimulatedWifi {
    fn new(credentials: WifiCredentials) -> Self {
        Self {
            connected: AtomicBool::new(false),
            credentials: StdMutex::new(credentials),
        }
    }

    fn credentials(&self) -> MutexGuard<'_, WifiCredentials> {
        self.credentials.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WifiControl for SimulatedWifi {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn connect(&self) -> Result<(), WifiConnectionStatus> {
        let ssid = self.credentials().ssid.clone();
        if ssid.trim().is_empty() {
            warn!("no wifi network configured");
            return Err(WifiConnectionStatus::WifiNotDiscovered);
        }
        info!("simulated wifi joined `{ssid}`");
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    fn reconfigure(&self, credentials: &WifiCredentials) {
        info!("wifi reconfigured for `{}`", credentials.ssid);
        *self.credentials() = credentials.clone();
        self.connected.store(false, Ordering::Relaxed);
    }
}

/// Provisioning stand-in driven through the dev API.
#[derive(Default)]
struct SimulatedBle {
    running: AtomicBool,
    last_status: StdMutex<Option<WifiConnectionStatus>>,
}

impl SimulatedBle {
    fn last_status(&self) -> Option<WifiConnectionStatus> {
        *self.last_status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BleProvisioning for SimulatedBle {
    fn is_gatt_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn start_gatt(&self) -> bool {
        info!("provisioning service started");
        *self.last_status.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.running.store(true, Ordering::Relaxed);
        true
    }

    fn stop_gatt(&self) {
        info!("provisioning service stopped");
        self.running.store(false, Ordering::Relaxed);
    }

    fn report_status(&self, status: WifiConnectionStatus) {
        info!("provisioning status {status:?} ({})", status.code());
        *self.last_status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }
}

struct ActiveSession {
    client: AsyncClient,
    telemetry_topic: String,
    event_loop: JoinHandle<()>,
}

/// IoT-Hub session over rumqttc. Plain TCP; point `IOT_HUB_HOST` at a local
/// broker when developing.
struct MqttSession {
    runtime: Handle,
    appliance: Arc<Appliance>,
    host_override: Option<String>,
    port: u16,
    active: StdMutex<Option<ActiveSession>>,
}

impl MqttSession {
    fn active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, connection_string: &str) -> anyhow::Result<ActiveSession> {
        let connection = IotHubConnection::parse(connection_string)?;
        let token = connection.sas_token(self.appliance.clock.unix_time() + SAS_TOKEN_TTL_SECS)?;
        let host = self
            .host_override
            .clone()
            .unwrap_or_else(|| connection.host_name.clone());

        info!("opening iot hub session to {host}:{} as {}", self.port, connection.device_id);
        let mut options = MqttOptions::new(connection.device_id.clone(), host, self.port);
        options.set_credentials(connection.username(), token);
        options.set_keep_alive(Duration::from_secs(MQTT_KEEP_ALIVE_SECS));
        options.set_max_packet_size(MAX_MQTT_PAYLOAD_BYTES * 2, MAX_MQTT_PAYLOAD_BYTES * 2);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let event_loop = self.runtime.spawn(drive_session(
            client.clone(),
            eventloop,
            Arc::clone(&self.appliance.session),
            Arc::clone(&self.appliance.methods),
        ));

        Ok(ActiveSession {
            client,
            telemetry_topic: connection.telemetry_topic(),
            event_loop,
        })
    }
}

impl AzureSession for MqttSession {
    fn status(&self) -> AzureStatus {
        self.appliance.session.get()
    }

    fn connect(&self, connection_string: &str) {
        self.idle();
        self.appliance.session.set(AzureStatus::Connecting);
        match self.open(connection_string) {
            Ok(active) => *self.active() = Some(active),
            Err(err) => {
                warn!("cannot open iot hub session: {err:#}");
                self.appliance.session.set(AzureStatus::Error);
            }
        }
    }

    fn idle(&self) {
        if let Some(active) = self.active().take() {
            if let Err(err) = active.client.try_disconnect() {
                warn!("iot hub disconnect failed: {err}");
            }
            active.event_loop.abort();
        }
        self.appliance.session.set(AzureStatus::Idle);
    }

    fn is_unable_to_send(&self) -> bool {
        self.appliance.session.is_unable_to_send()
    }
}

impl TelemetryPublisher for MqttSession {
    fn publish_telemetry(&self, body: &[u8]) -> bool {
        let active = self.active();
        let Some(active) = active.as_ref() else {
            return false;
        };
        match active.client.try_publish(
            active.telemetry_topic.as_str(),
            QoS::AtLeastOnce,
            false,
            body.to_vec(),
        ) {
            Ok(()) => true,
            Err(err) => {
                warn!("telemetry publish failed: {err}");
                false
            }
        }
    }
}

async fn drive_session(
    client: AsyncClient,
    mut eventloop: EventLoop,
    status: Arc<SessionStatus>,
    methods: Arc<DeviceMethodHandler>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("iot hub session connected");
                if let Err(err) = client.subscribe(METHOD_REQUEST_FILTER, QoS::AtMostOnce).await {
                    warn!("device method subscription failed: {err}");
                }
                status.set(AzureStatus::Connected);
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                    warn!(
                        "dropping oversized MQTT payload on topic {} ({} bytes)",
                        message.topic,
                        message.payload.len()
                    );
                    continue;
                }
                let Some(reply) = methods.handle(&message.topic, &message.payload) else {
                    continue;
                };
                if let Err(err) = client
                    .publish(reply.topic, QoS::AtMostOnce, false, reply.body)
                    .await
                {
                    warn!("device method reply failed: {err}");
                    status.record_send(false);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("iot hub session error: {err}");
                status.set(AzureStatus::Error);
                return;
            }
        }
    }
}

/// Stores the image next to the runtime config; a real flash happens on
/// the device only.
struct HostDownloader {
    agent: ureq::Agent,
    path: PathBuf,
}

impl HostDownloader {
    fn new(path: PathBuf) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(300))
                .build(),
            path,
        }
    }
}

impl FirmwareDownloader for HostDownloader {
    fn download_and_apply(&self, url: &str) -> Result<u64, FirmwareFailureReason> {
        let response = self.agent.get(url).call().map_err(|err| {
            warn!("firmware download failed: {}", ureq_error(url, err));
            FirmwareFailureReason::DownloadFailed
        })?;
        let image = read_limited(response.into_reader(), MAX_FIRMWARE_BYTES, url).map_err(|err| {
            warn!("firmware download failed: {err}");
            FirmwareFailureReason::DownloadFailed
        })?;
        if image.is_empty() {
            return Err(FirmwareFailureReason::ImageInvalid);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                warn!("cannot create firmware directory: {err}");
                FirmwareFailureReason::DownloadFailed
            })?;
        }
        std::fs::write(&self.path, &image).map_err(|err| {
            warn!("cannot store firmware image: {err}");
            FirmwareFailureReason::DownloadFailed
        })?;
        info!("firmware image stored at {}", self.path.display());
        Ok(image.len() as u64)
    }
}

/// Exits the process; a supervisor is expected to start it again.
struct HostSystem;

impl SystemControl for HostSystem {
    fn reboot(&self, delay_ms: u64) {
        warn!("restart requested, exiting in {delay_ms} ms");
        thread::sleep(Duration::from_millis(delay_ms));
        std::process::exit(0);
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_over_limit_is_refused() {
        let body = vec![b'x'; 10];

        assert_eq!(read_limited(&body[..], 10, "http://test").unwrap().len(), 10);
        assert!(matches!(
            read_limited(&body[..], 9, "http://test"),
            Err(HttpError::BodyTooLarge(9))
        ));
    }

    #[test]
    fn simulated_wifi_needs_an_ssid() {
        let wifi = SimulatedWifi::new(WifiCredentials::default());
        assert_eq!(wifi.connect(), Err(WifiConnectionStatus::WifiNotDiscovered));

        wifi.reconfigure(&WifiCredentials {
            ssid: "home".to_string(),
            password: "secret".to_string(),
            static_ip: None,
        });
        assert!(!wifi.is_connected());
        assert_eq!(wifi.connect(), Ok(()));
        assert!(wifi.is_connected());
    }
}
