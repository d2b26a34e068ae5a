//! Cloud discovery and health checking over HTTP.

pub mod discovery;
pub mod health;
pub mod service;

use crate::error::HttpError;

pub use discovery::DiscoveryService;
pub use health::HealthCheckService;
pub use service::{CloudService, CloudServiceCommand};

/// Health score of a fully reachable appliance.
pub const FULL_HEALTH: u8 = 100;

/// Blocking HTTP transport; the implementation owns the request timeout.
pub trait HttpClient: Send + Sync {
    fn post_json(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, HttpError>;
}

/// Network time synchronisation (SNTP on the device).
pub trait TimeSource: Send + Sync {
    /// False when the clock could not be synchronised this time.
    fn sync_time(&self) -> bool;
}

/// IoT-Hub connection strings handed out by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStrings {
    pub primary: String,
    pub secondary: String,
}
