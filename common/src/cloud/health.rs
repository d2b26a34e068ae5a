use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cloud::{HttpClient, FULL_HEALTH};
use crate::error::HealthCheckError;
use crate::queue::EventFlag;
use crate::settings::{DeviceMeta, Settings};
use crate::time::SystemClock;

#[derive(Debug, Serialize)]
struct HealthCheckRequest<'a> {
    #[serde(rename = "Gdid")]
    gdid: &'a str,
    #[serde(rename = "DirectAppliance")]
    direct_appliance: bool,
}

#[derive(Debug, Deserialize)]
struct TimeSynchronization {
    #[serde(rename = "UNIX_TIME")]
    unix_time: i64,
    #[serde(rename = "DAY_OF_WEEK", default)]
    day_of_week: u8,
    /// Seconds east of UTC.
    #[serde(rename = "UTC_OFFSET")]
    utc_offset: i32,
}

#[derive(Debug, Deserialize)]
struct HealthCheckResponse {
    #[serde(rename = "Health")]
    health: u8,
    #[serde(rename = "TimeSynchronization")]
    time: Option<TimeSynchronization>,
}

pub struct HealthCheckService {
    http: Arc<dyn HttpClient>,
    device: Arc<DeviceMeta>,
    settings: Arc<dyn Settings>,
    clock: Arc<dyn SystemClock>,
    url: String,
    healthy: Arc<EventFlag>,
}

impl HealthCheckService {
    pub fn new(
        http: Arc<dyn HttpClient>,
        device: Arc<DeviceMeta>,
        settings: Arc<dyn Settings>,
        clock: Arc<dyn SystemClock>,
        url: impl Into<String>,
        healthy: Arc<EventFlag>,
    ) -> Self {
        Self {
            http,
            device,
            settings,
            clock,
            url: url.into(),
            healthy,
        }
    }

    /// Reports the cloud's health score and applies the time it sent along.
    /// The health flag is set only for [`FULL_HEALTH`].
    pub fn check(&self) -> Result<u8, HealthCheckError> {
        let response = match self.request() {
            Ok(response) => response,
            Err(err) => {
                self.healthy.clear();
                return Err(err);
            }
        };

        if let Some(time) = &response.time {
            self.apply_time(time);
        }
        if response.health == FULL_HEALTH {
            self.healthy.set();
        } else {
            self.healthy.clear();
        }
        debug!("health check answered {}", response.health);
        Ok(response.health)
    }

    fn request(&self) -> Result<HealthCheckResponse, HealthCheckError> {
        let body = serde_json::to_vec(&HealthCheckRequest {
            gdid: self.device.gdid(),
            direct_appliance: self.device.is_direct_appliance(),
        })
        .map_err(HealthCheckError::Parse)?;
        let reply = self.http.post_json(&self.url, &body)?;
        serde_json::from_slice(&reply).map_err(HealthCheckError::Parse)
    }

    fn apply_time(&self, time: &TimeSynchronization) {
        if time.unix_time <= 0 {
            warn!("ignoring health check time {}", time.unix_time);
            return;
        }
        self.clock.set_unix_time(time.unix_time);
        if self.settings.utc_offset_secs() != time.utc_offset {
            info!("utc offset changed to {}s", time.utc_offset);
            self.settings.set_utc_offset_secs(time.utc_offset);
        }
        match self.clock.now_local(time.utc_offset) {
            Some(now) => self.settings.set_local_time(now),
            None => warn!("utc offset {}s out of range", time.utc_offset),
        }
        debug!("time synchronised, day of week {}", time.day_of_week);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::error::HttpError;
    use crate::settings::MemorySettings;
    use crate::time::AdjustableClock;

    struct FakeHttp(&'static str);

    impl HttpClient for FakeHttp {
        fn post_json(&self, _: &str, _: &[u8]) -> Result<Vec<u8>, HttpError> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    struct Fixture {
        settings: Arc<MemorySettings>,
        clock: Arc<AdjustableClock>,
        healthy: Arc<EventFlag>,
        service: HealthCheckService,
    }

    fn fixture(reply: &'static str) -> Fixture {
        let settings = Arc::new(MemorySettings::default());
        let clock = Arc::new(AdjustableClock::new());
        let healthy = Arc::new(EventFlag::new());
        let service = HealthCheckService::new(
            Arc::new(FakeHttp(reply)),
            Arc::new(DeviceMeta::new(&DeviceConfig::default())),
            settings.clone(),
            clock.clone(),
            "http://health",
            healthy.clone(),
        );
        Fixture {
            settings,
            clock,
            healthy,
            service,
        }
    }

    #[test]
    fn full_health_sets_flag_and_time() {
        let fixture = fixture(
            r#"{"Health": 100, "TimeSynchronization": {"UNIX_TIME": 1700000000, "DAY_OF_WEEK": 2, "UTC_OFFSET": 7200}}"#,
        );

        assert_eq!(fixture.service.check().unwrap(), FULL_HEALTH);

        assert!(fixture.healthy.is_set());
        assert!((fixture.clock.unix_time() - 1_700_000_000).abs() <= 1);
        assert_eq!(fixture.settings.utc_offset_secs(), 7200);
        assert!(fixture.settings.local_time().is_some());
    }

    #[test]
    fn partial_health_clears_flag() {
        let fixture = fixture(r#"{"Health": 40}"#);
        fixture.healthy.set();

        assert_eq!(fixture.service.check().unwrap(), 40);
        assert!(!fixture.healthy.is_set());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let fixture = fixture("not json");

        assert!(matches!(fixture.service.check(), Err(HealthCheckError::Parse(_))));
        assert!(!fixture.healthy.is_set());
    }
}
