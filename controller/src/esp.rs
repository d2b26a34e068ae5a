use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as EmbeddedHttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{
        EspMqttClient, EspMqttConnection, MqttClientConfiguration, MqttProtocolVersion,
    },
    netif::{EspNetif, NetifConfiguration, NetifStack},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use appliance_common::{
    cloud::{HttpClient, TimeSource},
    connection::task::{AzureSession, BleProvisioning, SystemControl, WifiControl},
    error::HttpError,
    iothub::{
        DeviceMethodHandler, IotHubConnection, SessionStatus, METHOD_REQUEST_FILTER,
        SAS_TOKEN_TTL_SECS,
    },
    protocol::FirmwareFailureReason,
    queue::Queue,
    types::{AzureStatus, StaticIp, WifiConnectionStatus, WifiCredentials},
    upgrade::FirmwareDownloader,
    RuntimeConfig, SystemClock,
};

use crate::runtime::{Appliance, Drivers, TelemetryPublisher};

const NVS_NAMESPACE: &str = "appliance";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 4096;
const OTA_CHUNK_SIZE: usize = 4096;
const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const SETTINGS_SAVE_PERIOD: Duration = Duration::from_secs(2);
const SNTP_WAIT: Duration = Duration::from_secs(15);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(60);

const PROVISIONING_INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Appliance Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.5rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}.muted{color:#555}
  </style>
</head>
<body>
  <h1>Appliance Setup</h1>
  <label>WiFi SSID</label><input id="ssid" type="text">
  <label>WiFi Password</label><input id="password" type="password">
  <button id="save">Connect</button>
  <p id="status" class="muted"></p>
  <script>
    const status = document.getElementById('status');
    async function poll() {
      const res = await fetch('/api/provisioning/status');
      const body = await res.json();
      status.textContent = body.status ? `Status: ${body.status}` : 'Waiting for credentials';
    }
    document.getElementById('save').onclick = async () => {
      const res = await fetch('/api/provisioning', {
        method: 'POST',
        headers: {'Content-Type': 'application/json'},
        body: JSON.stringify({
          ssid: document.getElementById('ssid').value,
          password: document.getElementById('password').value,
        }),
      });
      status.textContent = res.ok ? 'Connecting...' : (await res.json()).error;
    };
    setInterval(poll, 2000);
  </script>
</body>
</html>
"#;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Deserialize)]
struct CredentialsUpdate {
    ssid: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct ProvisioningStatusView {
    active: bool,
    status: Option<WifiConnectionStatus>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    info!(
        "appliance {} running firmware {}, wifi `{}`",
        runtime.device.gdid, runtime.device.firmware_version, runtime.network.wifi.ssid
    );

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let Peripherals { modem, .. } = Peripherals::take()?;
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let appliance = Arc::new(Appliance::new(
        runtime.clone(),
        Arc::new(EspClock),
        Arc::new(EspHttp),
        Arc::new(SntpTimeSource { sntp }),
    ));

    let network = Arc::new(EspNetwork {
        wifi: Mutex::new(wifi),
        credentials: Mutex::new(runtime.network.wifi.clone()),
        provisioning: Mutex::new(None),
        provisioning_status: Arc::new(Mutex::new(None)),
        reconnects: Arc::clone(&appliance.reconnects),
        ap_ssid: provisioning_ssid(appliance.device.gdid()),
        ap_password: format!("{:08}", appliance.device.bt_passkey()),
    });
    let session = Arc::new(EspIotHubSession {
        appliance: Arc::clone(&appliance),
        active: Mutex::new(None),
    });

    appliance.start(Drivers {
        wifi: network.clone(),
        ble: network,
        azure: session.clone(),
        telemetry: session,
        system: Arc::new(EspSystem),
        downloader: Arc::new(EspOtaDownloader),
    })?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut pending = false;
    loop {
        thread::sleep(SETTINGS_SAVE_PERIOD);
        feed_watchdog();

        pending |= appliance.settings.take_dirty();
        if !pending {
            continue;
        }
        let (settings, wifi) = appliance.settings.snapshot();
        runtime.settings = settings;
        runtime.network.wifi = wifi;
        match nvs_store.save_runtime_config(&runtime) {
            Ok(()) => pending = false,
            Err(err) => warn!("failed to persist settings: {err:#}"),
        }
    }
}

fn provisioning_ssid(gdid: &str) -> String {
    let tail = &gdid[gdid.len().saturating_sub(4)..];
    format!("Appliance-{tail}")
}

/// Wall time lives in the libc clock that SNTP also sets.
struct EspClock;

impl SystemClock for EspClock {
    fn unix_time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }

    fn set_unix_time(&self, unix_time: i64) {
        let now = esp_idf_svc::sys::timeval {
            tv_sec: unix_time as _,
            tv_usec: 0,
        };
        let rc = unsafe { esp_idf_svc::sys::settimeofday(&now, core::ptr::null()) };
        if rc != 0 {
            warn!("settimeofday failed with {rc}");
        }
    }

    fn uptime_ms(&self) -> u64 {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        u64::try_from(micros / 1000).unwrap_or(0)
    }
}

struct EspHttp;

impl EspHttp {
    fn client() -> anyhow::Result<EmbeddedHttpClient<EspHttpConnection>> {
        let conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(15)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        Ok(EmbeddedHttpClient::wrap(EspHttpConnection::new(&conf)?))
    }
}

impl HttpClient for EspHttp {
    fn post_json(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, HttpError> {
        let transport = |reason: String| HttpError::Transport {
            url: url.to_string(),
            reason,
        };

        let mut client = Self::client().map_err(|err| transport(format!("{err:#}")))?;
        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        let mut request = client
            .post(url, &headers)
            .map_err(|err| transport(format!("{err:?}")))?;
        request
            .write_all(body)
            .map_err(|err| transport(format!("{err:?}")))?;
        let mut response = request.submit().map_err(|err| transport(format!("{err:?}")))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(HttpError::Status(status));
        }

        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| transport(format!("{err:?}")))?;
            if read == 0 {
                return Ok(body);
            }
            if body.len() + read > MAX_HTTP_BODY {
                return Err(HttpError::BodyTooLarge(MAX_HTTP_BODY));
            }
            body.extend_from_slice(&chunk[..read]);
        }
    }
}

struct SntpTimeSource {
    sntp: EspSntp<'static>,
}

impl TimeSource for SntpTimeSource {
    fn sync_time(&self) -> bool {
        let poll = Duration::from_millis(250);
        let mut waited = Duration::ZERO;
        while self.sntp.get_sync_status() != SyncStatus::Completed {
            if waited >= SNTP_WAIT {
                return false;
            }
            thread::sleep(poll);
            waited += poll;
        }
        true
    }
}

/// Station link plus the SoftAP provisioning channel sharing one radio.
struct EspNetwork {
    wifi: Mutex<BlockingWifi<EspWifi<'static>>>,
    credentials: Mutex<WifiCredentials>,
    provisioning: Mutex<Option<EspHttpServer<'static>>>,
    provisioning_status: Arc<Mutex<Option<WifiConnectionStatus>>>,
    reconnects: Arc<Queue<WifiCredentials>>,
    ap_ssid: String,
    ap_password: String,
}

impl EspNetwork {
    fn wifi(&self) -> MutexGuard<'_, BlockingWifi<EspWifi<'static>>> {
        self.wifi.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn credentials(&self) -> WifiCredentials {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_provisioning(&self) -> bool {
        self.provisioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn configuration(&self, credentials: &WifiCredentials, with_ap: bool) -> anyhow::Result<Configuration> {
        let client = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method: if credentials.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        };
        if !with_ap {
            return Ok(Configuration::Client(client));
        }

        let ap = AccessPointConfiguration {
            ssid: self
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
            password: self
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("provisioning AP password too long"))?,
            auth_method: AuthMethod::WPA2Personal,
            channel: 1,
            ..Default::default()
        };
        Ok(Configuration::Mixed(client, ap))
    }

    fn apply_configuration(&self, with_ap: bool) -> anyhow::Result<()> {
        let credentials = self.credentials();
        let configuration = self.configuration(&credentials, with_ap)?;
        let mut wifi = self.wifi();
        wifi.set_configuration(&configuration)?;
        if !wifi.is_started()? {
            wifi.start()?;
        }
        Ok(())
    }

    fn join(&self, credentials: &WifiCredentials) -> Result<(), WifiConnectionStatus> {
        let with_ap = self.is_provisioning();
        if let Err(err) = self.apply_configuration(with_ap) {
            warn!("cannot configure wifi: {err:#}");
            return Err(WifiConnectionStatus::WifiNotDiscovered);
        }

        let mut wifi = self.wifi();
        let visible = match wifi.scan() {
            Ok(networks) => networks
                .iter()
                .any(|network| network.ssid.as_str() == credentials.ssid),
            Err(err) => {
                warn!("wifi scan failed: {err}");
                true
            }
        };
        if !visible {
            warn!("wifi `{}` not in range", credentials.ssid);
            return Err(WifiConnectionStatus::WifiNotDiscovered);
        }

        let joined = wifi.connect().and_then(|()| wifi.wait_netif_up());
        if let Err(err) = joined {
            warn!("wifi connect to `{}` failed: {err}", credentials.ssid);
            let _ = wifi.disconnect();
            return Err(WifiConnectionStatus::WrongPassword);
        }
        info!("wifi connected to `{}`", credentials.ssid);
        Ok(())
    }

    fn start_provisioning_server(&self) -> anyhow::Result<EspHttpServer<'static>> {
        let conf = HttpConfiguration {
            stack_size: 10 * 1024,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            req.into_ok_response()?
                .write_all(PROVISIONING_INDEX_HTML.as_bytes())?;
            Ok(())
        })?;

        {
            let status = Arc::clone(&self.provisioning_status);
            server.fn_handler("/api/provisioning/status", Method::Get, move |req| {
                let status = *status.lock().unwrap_or_else(PoisonError::into_inner);
                write_json(req, &ProvisioningStatusView { active: true, status })
            })?;
        }

        {
            let reconnects = Arc::clone(&self.reconnects);
            server.fn_handler::<anyhow::Error, _>(
                "/api/provisioning",
                Method::Post,
                move |mut req| {
                    let body = read_request_body(&mut req)?;
                    let update: CredentialsUpdate =
                        serde_json::from_slice(&body).context("invalid credentials payload")?;
                    let ssid = update.ssid.trim();
                    if ssid.is_empty() || ssid.len() > 32 {
                        return write_error(req, 400, "ssid must be 1-32 characters");
                    }
                    if update.password.len() > 64 {
                        return write_error(req, 400, "password must be at most 64 characters");
                    }

                    reconnects.replace(WifiCredentials {
                        ssid: ssid.to_string(),
                        password: update.password,
                        static_ip: None,
                    });
                    write_json(req, &serde_json::json!({ "accepted": true }))
                },
            )?;
        }

        Ok(server)
    }
}

impl WifiControl for EspNetwork {
    fn is_connected(&self) -> bool {
        is_wifi_station_connected()
    }

    fn connect(&self) -> Result<(), WifiConnectionStatus> {
        let credentials = self.credentials();
        if credentials.ssid.trim().is_empty() {
            warn!("no wifi network configured");
            return Err(WifiConnectionStatus::WifiNotDiscovered);
        }
        self.join(&credentials)
    }

    fn disconnect(&self) {
        if let Err(err) = self.wifi().disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }

    fn reconfigure(&self, credentials: &WifiCredentials) {
        info!("wifi reconfigured for `{}`", credentials.ssid);
        *self.credentials.lock().unwrap_or_else(PoisonError::into_inner) = credentials.clone();
        self.disconnect();

        let netif = match &credentials.static_ip {
            Some(static_ip) => build_static_netif(static_ip),
            None => EspNetif::new(NetifStack::Sta).map_err(anyhow::Error::from),
        };
        match netif {
            Ok(netif) => {
                if let Err(err) = self.wifi().wifi_mut().swap_netif_sta(netif) {
                    warn!("failed to apply station netif: {err}");
                }
            }
            Err(err) => warn!("invalid station IP configuration: {err:#}"),
        }
    }
}

impl BleProvisioning for EspNetwork {
    fn is_gatt_running(&self) -> bool {
        self.is_provisioning()
    }

    fn start_gatt(&self) -> bool {
        *self
            .provisioning_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(err) = self.apply_configuration(true) {
            warn!("failed to start provisioning AP: {err:#}");
            return false;
        }
        match self.start_provisioning_server() {
            Ok(server) => {
                *self.provisioning.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);
                info!("provisioning AP `{}` started", self.ap_ssid);
                true
            }
            Err(err) => {
                warn!("failed to start provisioning server: {err:#}");
                false
            }
        }
    }

    fn stop_gatt(&self) {
        let server = self
            .provisioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if server.is_none() {
            return;
        }
        drop(server);
        if let Err(err) = self.apply_configuration(false) {
            warn!("failed to stop provisioning AP: {err:#}");
        }
        info!("provisioning AP stopped");
    }

    fn report_status(&self, status: WifiConnectionStatus) {
        info!("provisioning status {status:?} ({})", status.code());
        *self
            .provisioning_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);
    }
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn build_static_netif(static_ip: &StaticIp) -> anyhow::Result<EspNetif> {
    let mask_ip = ipv4_from_octets(static_ip.subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {mask_ip}"))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: ipv4_from_octets(static_ip.ip),
                subnet: Subnet {
                    gateway: ipv4_from_octets(static_ip.gateway),
                    mask,
                },
                dns: static_ip.dns.map(ipv4_from_octets),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(EspNetif::new_with_conf(&conf)?)
}

struct ActiveSession {
    client: Arc<Mutex<EspMqttClient<'static>>>,
    telemetry_topic: String,
    closed: Arc<AtomicBool>,
}

struct EspIotHubSession {
    appliance: Arc<Appliance>,
    active: Mutex<Option<ActiveSession>>,
}

impl EspIotHubSession {
    fn active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, connection_string: &str) -> anyhow::Result<ActiveSession> {
        let connection = IotHubConnection::parse(connection_string)?;
        let token = connection.sas_token(self.appliance.clock.unix_time() + SAS_TOKEN_TTL_SECS)?;
        let username = connection.username();
        let url = format!(
            "mqtts://{}:{}",
            connection.host_name, self.appliance.config.network.iot_hub_port
        );

        let conf = MqttClientConfiguration {
            client_id: Some(connection.device_id.as_str()),
            username: Some(username.as_str()),
            password: Some(token.as_str()),
            protocol_version: Some(MqttProtocolVersion::V3_1_1),
            keep_alive_interval: Some(MQTT_KEEP_ALIVE),
            buffer_size: MAX_MQTT_PAYLOAD_BYTES,
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        info!("opening iot hub session to {url} as {}", connection.device_id);
        let (client, conn) = EspMqttClient::new(url.as_str(), &conf)?;

        let client = Arc::new(Mutex::new(client));
        let closed = Arc::new(AtomicBool::new(false));
        spawn_session_receiver(
            conn,
            Arc::clone(&client),
            Arc::clone(&closed),
            Arc::clone(&self.appliance.session),
            Arc::clone(&self.appliance.methods),
        )?;

        Ok(ActiveSession {
            client,
            telemetry_topic: connection.telemetry_topic(),
            closed,
        })
    }
}

impl AzureSession for EspIotHubSession {
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
            active.closed.store(true, Ordering::Relaxed);
        }
        self.appliance.session.set(AzureStatus::Idle);
    }

    fn is_unable_to_send(&self) -> bool {
        self.appliance.session.is_unable_to_send()
    }
}

impl TelemetryPublisher for EspIotHubSession {
    fn publish_telemetry(&self, body: &[u8]) -> bool {
        let active = self.active();
        let Some(active) = active.as_ref() else {
            return false;
        };
        let mut client = active.client.lock().unwrap_or_else(PoisonError::into_inner);
        match client.enqueue(&active.telemetry_topic, QoS::AtLeastOnce, false, body) {
            Ok(_) => true,
            Err(err) => {
                warn!("telemetry publish failed: {err}");
                false
            }
        }
    }
}

/// The client is dropped by this thread once the session is closed, which
/// ends the connection's event stream.
fn spawn_session_receiver(
    mut conn: EspMqttConnection,
    client: Arc<Mutex<EspMqttClient<'static>>>,
    closed: Arc<AtomicBool>,
    status: Arc<SessionStatus>,
    methods: Arc<DeviceMethodHandler>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("iothub-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let mut client = Some(client);
            while let Ok(event) = conn.next() {
                if closed.load(Ordering::Relaxed) {
                    client.take();
                    continue;
                }
                let Some(mqtt) = client.as_ref() else {
                    continue;
                };

                match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("iot hub session connected");
                        let mut mqtt = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Err(err) = mqtt.subscribe(METHOD_REQUEST_FILTER, QoS::AtMostOnce) {
                            warn!("device method subscription failed: {err}");
                        }
                        status.set(AzureStatus::Connected);
                    }
                    EventPayload::Disconnected => {
                        warn!("iot hub session disconnected");
                        status.set(AzureStatus::Error);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        let Some(reply) = methods.handle(topic, data) else {
                            continue;
                        };
                        let mut mqtt = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Err(err) =
                            mqtt.enqueue(&reply.topic, QoS::AtMostOnce, false, &reply.body)
                        {
                            warn!("device method reply failed: {err}");
                            status.record_send(false);
                        }
                    }
                    EventPayload::Error(err) => warn!("iot hub session error: {err}"),
                    _ => {}
                }
            }
            info!("iot hub session receiver finished");
        })
        .context("failed to spawn iot hub receiver thread")?;
    Ok(())
}

struct EspOtaDownloader;

impl FirmwareDownloader for EspOtaDownloader {
    fn download_and_apply(&self, url: &str) -> Result<u64, FirmwareFailureReason> {
        download_and_apply_ota(url).map_err(|(reason, err)| {
            warn!("firmware upgrade failed: {err:#}");
            reason
        })
    }
}

fn download_and_apply_ota(url: &str) -> Result<u64, (FirmwareFailureReason, anyhow::Error)> {
    let download = |err: anyhow::Error| (FirmwareFailureReason::DownloadFailed, err);
    let invalid = |err: anyhow::Error| (FirmwareFailureReason::ImageInvalid, err);

    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf).map_err(|err| download(err.into()))?;
    let mut client = EmbeddedHttpClient::wrap(connection);
    let request = client
        .request(Method::Get, url, &[])
        .map_err(|err| download(anyhow!("{err:?}")))?;
    let mut response = request.submit().map_err(|err| download(anyhow!("{err:?}")))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(download(anyhow!("firmware download failed with HTTP {status}")));
    }

    let mut ota = EspOta::new().map_err(|err| invalid(anyhow!("failed to acquire OTA: {err:?}")))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| invalid(anyhow!("failed to initiate OTA update: {err:?}")))?;

    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];
    loop {
        let read = response
            .read(&mut chunk)
            .map_err(|err| download(anyhow!("{err:?}")))?;
        if read == 0 {
            break;
        }
        update
            .write(&chunk[..read])
            .map_err(|err| invalid(anyhow!("failed writing OTA data: {err:?}")))?;
        total_written = total_written.saturating_add(read as u64);
    }

    if total_written == 0 {
        return Err(invalid(anyhow!("firmware image is empty")));
    }
    update
        .complete()
        .map_err(|err| invalid(anyhow!("failed finalizing OTA image: {err:?}")))?;
    info!("firmware image written ({total_written} bytes)");
    Ok(total_written)
}

struct EspSystem;

impl SystemControl for EspSystem {
    fn reboot(&self, delay_ms: u64) {
        thread::sleep(Duration::from_millis(delay_ms));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}
