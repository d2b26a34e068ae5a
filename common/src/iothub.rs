//! IoT-Hub MQTT conventions shared by the session drivers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use sha2::Sha256;

use crate::error::ConnectionStringError;
use crate::payload::{AzurePayload, FirmwareUpgradeControl, PayloadContext, SyncCache};
use crate::settings::{DeviceMeta, Settings};
use crate::time::SystemClock;
use crate::types::AzureStatus;

pub const API_VERSION: &str = "2021-04-12";
/// Subscription covering every device-method request.
pub const METHOD_REQUEST_FILTER: &str = "$iothub/methods/POST/#";
/// Lifetime of a generated SAS token.
pub const SAS_TOKEN_TTL_SECS: i64 = 3600;
/// Consecutive failed publishes before the session counts as unable to send.
pub const MAX_FAILED_SENDS: u8 = 3;

const METHOD_REQUEST_PREFIX: &str = "$iothub/methods/POST/";

/// The parts of a device connection string the MQTT session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IotHubConnection {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl IotHubConnection {
    /// Parses `HostName=..;DeviceId=..;SharedAccessKey=..` in any order.
    pub fn parse(connection_string: &str) -> Result<Self, ConnectionStringError> {
        let (mut host_name, mut device_id, mut key) = (None, None, None);
        for part in connection_string.split(';') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match name.trim() {
                "HostName" => host_name = Some(value),
                "DeviceId" => device_id = Some(value),
                "SharedAccessKey" => key = Some(value),
                _ => {}
            }
        }

        let required = |value: Option<&str>, name: &'static str| {
            value
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or(ConnectionStringError::Missing(name))
        };
        Ok(Self {
            host_name: required(host_name, "HostName")?,
            device_id: required(device_id, "DeviceId")?,
            shared_access_key: required(key, "SharedAccessKey")?,
        })
    }

    pub fn username(&self) -> String {
        format!("{}/{}/?api-version={API_VERSION}", self.host_name, self.device_id)
    }

    pub fn telemetry_topic(&self) -> String {
        format!("devices/{}/messages/events/", self.device_id)
    }

    /// Signs the device resource URI with the shared access key.
    pub fn sas_token(&self, expiry_unix: i64) -> Result<String, ConnectionStringError> {
        let resource = format!("{}/devices/{}", self.host_name, self.device_id);
        let resource: String = form_urlencoded::byte_serialize(resource.as_bytes()).collect();

        let key = STANDARD
            .decode(&self.shared_access_key)
            .map_err(|_| ConnectionStringError::InvalidKey)?;
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&key).map_err(|_| ConnectionStringError::InvalidKey)?;
        mac.update(format!("{resource}\n{expiry_unix}").as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        let signature: String = form_urlencoded::byte_serialize(signature.as_bytes()).collect();

        Ok(format!(
            "SharedAccessSignature sr={resource}&sig={signature}&se={expiry_unix}"
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRequest<'a> {
    pub name: &'a str,
    pub request_id: &'a str,
}

/// Splits `$iothub/methods/POST/{name}/?$rid={rid}`.
pub fn parse_method_topic(topic: &str) -> Option<MethodRequest<'_>> {
    let rest = topic.strip_prefix(METHOD_REQUEST_PREFIX)?;
    let (name, query) = rest.split_once("/?")?;
    let request_id = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("$rid="))?;
    if name.is_empty() || request_id.is_empty() {
        return None;
    }
    Some(MethodRequest { name, request_id })
}

pub fn method_response_topic(status: u16, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

/// Session status as seen by the connection controller, written by the
/// MQTT event loop.
#[derive(Debug, Default)]
pub struct SessionStatus {
    status: Mutex<AzureStatus>,
    failed_sends: AtomicU8,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> AzureStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, status: AzureStatus) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != status {
            debug!("iot hub session {:?} -> {status:?}", *current);
            *current = status;
        }
        if status != AzureStatus::Connected {
            self.failed_sends.store(0, Ordering::Relaxed);
        }
    }

    pub fn record_send(&self, delivered: bool) {
        if delivered {
            self.failed_sends.store(0, Ordering::Relaxed);
        } else {
            let failures = self.failed_sends.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            warn!("iot hub publish failed ({failures} in a row)");
        }
    }

    pub fn is_unable_to_send(&self) -> bool {
        self.failed_sends.load(Ordering::Relaxed) >= MAX_FAILED_SENDS
    }
}

/// Reply to publish for one device-method request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodReply {
    pub topic: String,
    pub body: Vec<u8>,
}

/// Owns what a device-method call needs and answers it.
pub struct DeviceMethodHandler {
    pub settings: Arc<dyn Settings>,
    pub device: Arc<DeviceMeta>,
    pub clock: Arc<dyn SystemClock>,
    pub sync: Arc<SyncCache>,
    pub firmware: Arc<dyn FirmwareUpgradeControl>,
}

impl DeviceMethodHandler {
    /// `None` when the topic is not a device-method request.
    pub fn handle(&self, topic: &str, payload: &[u8]) -> Option<MethodReply> {
        let request = parse_method_topic(topic)?;
        let response = self.invoke(request.name, payload);
        Some(MethodReply {
            topic: method_response_topic(response.0, request.request_id),
            body: response.1,
        })
    }

    /// Runs one method by name, returning its status and JSON body.
    pub fn invoke(&self, method: &str, payload: &[u8]) -> (u16, Vec<u8>) {
        let ctx = PayloadContext {
            settings: self.settings.as_ref(),
            device: self.device.as_ref(),
            clock: self.clock.as_ref(),
            sync: self.sync.as_ref(),
        };
        let response = AzurePayload::new(ctx, self.firmware.as_ref()).handle_device_method(method, payload);
        (response.status, response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::payload::azure::{STATUS_METHOD_NOT_ALLOWED, STATUS_OK};
    use crate::protocol::firmware::FirmwareVersion;
    use crate::settings::MemorySettings;
    use crate::time::AdjustableClock;
    use pretty_assertions::assert_eq;

    const CONNECTION_STRING: &str = "HostName=hub.example.net;DeviceId=appliance-01;\
         SharedAccessKey=YXBwbGlhbmNlLXRlc3Qta2V5LTAxMjM0NTY3ODk=";

    struct NoFirmware;

    impl FirmwareUpgradeControl for NoFirmware {
        fn set_url(&self, _: &str, _: FirmwareVersion) {}

        fn signal_upgrade_request(&self) -> bool {
            false
        }
    }

    fn handler() -> DeviceMethodHandler {
        DeviceMethodHandler {
            settings: Arc::new(MemorySettings::default()),
            device: Arc::new(DeviceMeta::new(&DeviceConfig::default())),
            clock: Arc::new(AdjustableClock::new()),
            sync: Arc::new(SyncCache::new()),
            firmware: Arc::new(NoFirmware),
        }
    }

    #[test]
    fn connection_string_parts_are_extracted() {
        let connection = IotHubConnection::parse(CONNECTION_STRING).unwrap();

        assert_eq!(connection.host_name, "hub.example.net");
        assert_eq!(connection.device_id, "appliance-01");
        assert_eq!(connection.shared_access_key, "YXBwbGlhbmNlLXRlc3Qta2V5LTAxMjM0NTY3ODk=");
        assert_eq!(connection.username(), "hub.example.net/appliance-01/?api-version=2021-04-12");
        assert_eq!(connection.telemetry_topic(), "devices/appliance-01/messages/events/");
    }

    #[test]
    fn incomplete_connection_string_is_rejected() {
        assert_eq!(
            IotHubConnection::parse("HostName=hub.example.net;DeviceId=;SharedAccessKey=abc"),
            Err(ConnectionStringError::Missing("DeviceId"))
        );
        assert_eq!(
            IotHubConnection::parse("garbage"),
            Err(ConnectionStringError::Missing("HostName"))
        );
    }

    #[test]
    fn sas_token_matches_reference_signature() {
        let connection = IotHubConnection::parse(CONNECTION_STRING).unwrap();

        assert_eq!(
            connection.sas_token(1_700_000_000).unwrap(),
            "SharedAccessSignature sr=hub.example.net%2Fdevices%2Fappliance-01\
             &sig=kfZowugvcCI%2Bt0qX8PrER%2F8%2BzeiHlfjQgkFdTNGek8Y%3D&se=1700000000"
        );
    }

    #[test]
    fn non_base64_key_cannot_sign() {
        let mut connection = IotHubConnection::parse(CONNECTION_STRING).unwrap();
        connection.shared_access_key = "not base64!".to_string();

        assert_eq!(connection.sas_token(0), Err(ConnectionStringError::InvalidKey));
    }

    #[test]
    fn method_topics_are_parsed() {
        assert_eq!(
            parse_method_topic("$iothub/methods/POST/transferFrame/?$rid=42"),
            Some(MethodRequest { name: "transferFrame", request_id: "42" })
        );
        assert_eq!(parse_method_topic("$iothub/methods/POST/transferFrame/"), None);
        assert_eq!(parse_method_topic("devices/x/messages/devicebound/"), None);
    }

    #[test]
    fn repeated_send_failures_mark_session_unable_to_send() {
        let status = SessionStatus::new();
        status.set(AzureStatus::Connected);

        for _ in 0..MAX_FAILED_SENDS {
            assert!(!status.is_unable_to_send());
            status.record_send(false);
        }
        assert!(status.is_unable_to_send());

        status.set(AzureStatus::Idle);
        assert!(!status.is_unable_to_send());
    }

    #[test]
    fn method_reply_goes_to_response_topic() {
        let handler = handler();

        let reply = handler
            .handle("$iothub/methods/POST/reboot/?$rid=7", b"{}")
            .unwrap();
        assert_eq!(reply.topic, format!("$iothub/methods/res/{STATUS_METHOD_NOT_ALLOWED}/?$rid=7"));

        let body = format!(r#"{{"timeoutInMilliSec": 1000, "frame": "{}"}}"#, STANDARD.encode([0x00, 0x14, 0x00, 0x00]));
        let reply = handler
            .handle("$iothub/methods/POST/transferFrame/?$rid=8", body.as_bytes())
            .unwrap();
        assert_eq!(reply.topic, format!("$iothub/methods/res/{STATUS_OK}/?$rid=8"));
    }
}
