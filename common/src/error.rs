use thiserror::Error;

use crate::types::WifiConnectionStatus;

#[derive(Debug, Error)]
pub enum TransferFrameError {
    #[error("transfer frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transfer frame carries no frame data")]
    MissingFrame,
    #[error("frame data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded frame has unsupported size {0}")]
    FrameSize(usize),
    #[error("cannot encode an empty frame")]
    EmptyFrame,
    #[error("encoded frame does not fit the {0} byte encode buffer")]
    EncodeBuffer(usize),
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Send(#[from] HttpError),
    #[error("discovery response is not valid JSON: {0}")]
    Parse(serde_json::Error),
    #[error("discovery response lacks connection strings")]
    MissingFields,
}

impl DiscoveryError {
    /// Code pushed to the provisioning characteristic for this failure.
    pub fn status(&self) -> WifiConnectionStatus {
        match self {
            Self::Send(_) => WifiConnectionStatus::DiscoverySendFailed,
            Self::Parse(_) => WifiConnectionStatus::DiscoveryParseFailed,
            Self::MissingFields => WifiConnectionStatus::DiscoveryMissingFields,
        }
    }
}

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("health check request failed: {0}")]
    Send(#[from] HttpError),
    #[error("health check response is not valid JSON: {0}")]
    Parse(serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionStringError {
    #[error("connection string lacks {0}")]
    Missing(&'static str),
    #[error("shared access key is not valid base64")]
    InvalidKey,
}
