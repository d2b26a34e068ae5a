use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::cloud::{ConnectionStrings, HttpClient};
use crate::error::DiscoveryError;
use crate::queue::Queue;
use crate::settings::DeviceMeta;
use crate::types::WifiConnectionStatus;

#[derive(Debug, Serialize)]
struct DiscoveryRequest<'a> {
    #[serde(rename = "Gdid")]
    gdid: &'a str,
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "DirectAppliance")]
    direct_appliance: bool,
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(rename = "Primary")]
    primary: Option<String>,
    #[serde(rename = "Secondary")]
    secondary: Option<String>,
}

/// Asks the discovery endpoint which IoT-Hub this appliance belongs to.
pub struct DiscoveryService {
    http: Arc<dyn HttpClient>,
    device: Arc<DeviceMeta>,
    url: String,
    results: Arc<Queue<WifiConnectionStatus>>,
    connection_strings: Arc<Queue<ConnectionStrings>>,
}

impl DiscoveryService {
    pub fn new(
        http: Arc<dyn HttpClient>,
        device: Arc<DeviceMeta>,
        url: impl Into<String>,
        results: Arc<Queue<WifiConnectionStatus>>,
        connection_strings: Arc<Queue<ConnectionStrings>>,
    ) -> Self {
        Self {
            http,
            device,
            url: url.into(),
            results,
            connection_strings,
        }
    }

    /// One discovery round. Failures land in the result queue, connection
    /// strings in theirs; both queues only ever hold the latest value.
    pub fn discover(&self) -> bool {
        match self.request() {
            Ok(strings) => {
                info!("discovery succeeded");
                self.connection_strings.replace(strings);
                true
            }
            Err(err) => {
                warn!("{err}");
                self.results.replace(err.status());
                false
            }
        }
    }

    pub fn request(&self) -> Result<ConnectionStrings, DiscoveryError> {
        let body = serde_json::to_vec(&DiscoveryRequest {
            gdid: self.device.gdid(),
            version: self.device.firmware_version().to_string(),
            direct_appliance: self.device.is_direct_appliance(),
        })
        .map_err(DiscoveryError::Parse)?;

        let reply = self.http.post_json(&self.url, &body)?;
        let response: DiscoveryResponse =
            serde_json::from_slice(&reply).map_err(DiscoveryError::Parse)?;

        match (response.primary, response.secondary) {
            (Some(primary), Some(secondary)) if !primary.is_empty() && !secondary.is_empty() => {
                Ok(ConnectionStrings { primary, secondary })
            }
            _ => Err(DiscoveryError::MissingFields),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::error::HttpError;
    use std::sync::Mutex;

    struct FakeHttp {
        reply: Result<&'static str, u16>,
        sent: Mutex<Vec<serde_json::Value>>,
    }

    impl HttpClient for FakeHttp {
        fn post_json(&self, _: &str, body: &[u8]) -> Result<Vec<u8>, HttpError> {
            self.sent.lock().unwrap().push(serde_json::from_slice(body).unwrap());
            self.reply
                .map(|text| text.as_bytes().to_vec())
                .map_err(HttpError::Status)
        }
    }

    fn service(reply: Result<&'static str, u16>) -> (DiscoveryService, Arc<FakeHttp>) {
        let http = Arc::new(FakeHttp {
            reply,
            sent: Mutex::new(Vec::new()),
        });
        let device = Arc::new(DeviceMeta::new(&DeviceConfig {
            gdid: "4711".to_string(),
            ..DeviceConfig::default()
        }));
        let service = DiscoveryService::new(
            http.clone(),
            device,
            "http://discovery",
            Arc::new(Queue::new(1)),
            Arc::new(Queue::new(1)),
        );
        (service, http)
    }

    #[test]
    fn success_publishes_connection_strings() {
        let (service, http) = service(Ok(r#"{"Primary": "HostName=a", "Secondary": "HostName=b"}"#));

        assert!(service.discover());

        let sent = &http.sent.lock().unwrap()[0];
        assert_eq!(sent["Gdid"], "4711");
        assert_eq!(sent["Version"], "1.0.0");
        assert_eq!(sent["DirectAppliance"], true);
        assert_eq!(
            service.connection_strings.try_pop(),
            Some(ConnectionStrings {
                primary: "HostName=a".to_string(),
                secondary: "HostName=b".to_string(),
            })
        );
        assert_eq!(service.results.num_waiting(), 0);
    }

    #[test]
    fn failures_map_to_status_codes() {
        let cases = [
            (Err(503), WifiConnectionStatus::DiscoverySendFailed),
            (Ok("<html>"), WifiConnectionStatus::DiscoveryParseFailed),
            (Ok(r#"{"Primary": "HostName=a"}"#), WifiConnectionStatus::DiscoveryMissingFields),
        ];

        for (reply, expected) in cases {
            let (service, _) = service(reply);
            assert!(!service.discover());
            assert_eq!(service.results.try_pop(), Some(expected));
            assert_eq!(service.connection_strings.num_waiting(), 0);
        }
    }
}
