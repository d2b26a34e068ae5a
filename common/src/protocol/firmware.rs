//! Firmware upgrade announcement from the cloud and the status report sent
//! back once an upgrade attempt ends.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameBuilder, FrameBuilderUser, FrameType};
use crate::types::FirmwareUpgradeState;

pub const MIN_READY_SIZE: usize = 7;
pub const MAX_FIRMWARE_URL_LEN: usize = 200;
const URL_LEN_OFFSET: usize = 5;
const URL_OFFSET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// `[0x00 0x01][major][minor][patch][url len][url..]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareUpdateReady {
    pub version: FirmwareVersion,
    pub url: String,
}

impl FirmwareUpdateReady {
    pub fn parse<F: Frame + ?Sized>(frame: &F) -> Option<Self> {
        let bytes = frame.as_bytes();
        if !FrameType::FwUpdateReady.matches(frame) || bytes.len() < MIN_READY_SIZE {
            debug!("firmware update ready rejected: {} bytes", bytes.len());
            return None;
        }

        let url_len = usize::from(bytes[URL_LEN_OFFSET]);
        if url_len == 0 || url_len > MAX_FIRMWARE_URL_LEN {
            debug!("firmware url length {url_len} out of range");
            return None;
        }
        if bytes.len() != URL_OFFSET + url_len {
            debug!(
                "firmware update ready carries {} bytes, expected {}",
                bytes.len(),
                URL_OFFSET + url_len
            );
            return None;
        }

        let url = std::str::from_utf8(&bytes[URL_OFFSET..]).ok()?.to_string();
        Some(Self {
            version: FirmwareVersion {
                major: bytes[2],
                minor: bytes[3],
                patch: bytes[4],
            },
            url,
        })
    }

    pub fn build(&self) -> Option<FrameBuilderUser> {
        let url_len = u8::try_from(self.url.len())
            .ok()
            .filter(|len| (1..=MAX_FIRMWARE_URL_LEN).contains(&usize::from(*len)))?;
        let mut builder: FrameBuilder = FrameBuilder::new();
        let written = builder.add_u16_msb(FrameType::FwUpdateReady.id())
            && builder.add_bytes(&[self.version.major, self.version.minor, self.version.patch])
            && builder.add_u8(url_len)
            && builder.add_bytes(self.url.as_bytes());
        written.then(|| builder.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirmwareFailureReason {
    #[default]
    None,
    DownloadFailed,
    ImageInvalid,
    Timeout,
    Blocked,
}

impl FirmwareFailureReason {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::None => 0,
            Self::DownloadFailed => 1,
            Self::ImageInvalid => 2,
            Self::Timeout => 3,
            Self::Blocked => 4,
        }
    }
}

/// `[0x00 0x02][state][failure reason][retry count]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareUpdateStatus {
    pub state: FirmwareUpgradeState,
    pub failure_reason: FirmwareFailureReason,
    pub retry_count: u8,
}

impl FirmwareUpdateStatus {
    pub fn build(&self) -> FrameBuilderUser {
        let mut builder: FrameBuilder = FrameBuilder::new();
        builder.add_u16_msb(FrameType::FwUpdateStatus.id());
        builder.add_u8(self.state.to_wire());
        builder.add_u8(self.failure_reason.to_wire());
        builder.add_u8(self.retry_count);
        builder.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameParser;
    use pretty_assertions::assert_eq;

    fn ready_bytes(url: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x00, 0x01, 2, 4, 1, url.len() as u8];
        bytes.extend_from_slice(url);
        bytes
    }

    #[test]
    fn parses_version_and_url() {
        let frame = FrameParser::new(&ready_bytes(b"https://fw.example/2.4.1.bin"));

        let ready = FirmwareUpdateReady::parse(&frame).unwrap();

        assert_eq!(ready.version.to_string(), "2.4.1");
        assert_eq!(ready.url, "https://fw.example/2.4.1.bin");
        assert_eq!(ready.build().unwrap().as_bytes(), frame.as_bytes());
    }

    #[test]
    fn rejects_empty_or_oversized_url() {
        assert_eq!(FirmwareUpdateReady::parse(&FrameParser::new(&ready_bytes(b""))), None);
        assert_eq!(
            FirmwareUpdateReady::parse(&FrameParser::new(&ready_bytes(&[b'a'; 201]))),
            None
        );
        assert!(FirmwareUpdateReady::parse(&FrameParser::new(&ready_bytes(&[b'a'; 200]))).is_some());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = ready_bytes(b"http://x");
        bytes.push(0);

        assert_eq!(FirmwareUpdateReady::parse(&FrameParser::new(&bytes)), None);
        assert_eq!(
            FirmwareUpdateReady::parse(&FrameParser::new(&bytes[..bytes.len() - 2])),
            None
        );
    }

    #[test]
    fn status_report_layout() {
        let status = FirmwareUpdateStatus {
            state: FirmwareUpgradeState::Failed,
            failure_reason: FirmwareFailureReason::DownloadFailed,
            retry_count: 2,
        };

        assert_eq!(status.build().as_bytes(), &[0x00, 0x02, 4, 1, 2]);
    }
}
