use log::debug;

use crate::frame::{Frame, FrameBuilder, FrameBuilderUser, FrameType};

const INFO_SIZE: usize = 10;
const UNIX_TIME_OFFSET: usize = 2;
const UTC_OFFSET_OFFSET: usize = 6;

/// Cloud time push: `[0x00 0x11][unix u32 LSB][utc offset seconds i32 LSB]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncInfo {
    pub unix_time: u32,
    pub utc_offset_secs: i32,
}

impl TimeSyncInfo {
    pub fn parse<F: Frame + ?Sized>(frame: &F) -> Option<Self> {
        if !FrameType::TimeSyncInfo.matches(frame) || frame.size() != INFO_SIZE {
            debug!("time sync info rejected: {} bytes", frame.size());
            return None;
        }
        let bytes = frame.as_bytes();
        let unix_time = u32::from_le_bytes(bytes[UNIX_TIME_OFFSET..UTC_OFFSET_OFFSET].try_into().ok()?);
        let utc_offset_secs = i32::from_le_bytes(bytes[UTC_OFFSET_OFFSET..INFO_SIZE].try_into().ok()?);
        Some(Self {
            unix_time,
            utc_offset_secs,
        })
    }

    pub fn build(&self) -> FrameBuilderUser {
        let mut builder: FrameBuilder = FrameBuilder::new();
        builder.add_u16_msb(FrameType::TimeSyncInfo.id());
        builder.add_u32_lsb(self.unix_time);
        builder.add_i32_lsb(self.utc_offset_secs);
        builder.into()
    }
}

/// Asks the cloud for a [`TimeSyncInfo`].
pub fn time_sync_request() -> FrameBuilderUser {
    let mut builder: FrameBuilder = FrameBuilder::new();
    builder.add_u16_msb(FrameType::TimeSyncRequest.id());
    builder.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameParser;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_info_fields_little_endian() {
        let frame = FrameParser::new(&[0x00, 0x11, 0x80, 0x1d, 0x2c, 0x04, 0x10, 0x0e, 0x00, 0x00]);

        assert_eq!(
            TimeSyncInfo::parse(&frame),
            Some(TimeSyncInfo {
                unix_time: 0x042c_1d80,
                utc_offset_secs: 3600,
            })
        );
    }

    #[test]
    fn negative_offset_survives_build_and_parse() {
        let info = TimeSyncInfo {
            unix_time: 1_700_000_000,
            utc_offset_secs: -18_000,
        };

        assert_eq!(TimeSyncInfo::parse(&info.build()), Some(info));
    }

    #[test]
    fn rejects_wrong_size_or_tag() {
        assert_eq!(TimeSyncInfo::parse(&FrameParser::new(&[0x00, 0x11, 0, 0, 0, 0])), None);
        assert_eq!(
            TimeSyncInfo::parse(&FrameParser::new(&[0x00, 0x10, 0, 0, 0, 0, 0, 0, 0, 0])),
            None
        );
    }

    #[test]
    fn request_is_bare_tag() {
        assert_eq!(time_sync_request().as_bytes(), &[0x00, 0x10]);
    }
}
