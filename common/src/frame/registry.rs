use super::{BigEndianU16, Frame, LittleEndianU16};

/// Byte order a frame type writes its tag in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOrder {
    Msb,
    Lsb,
}

/// Closed set of frame type IDs exchanged with the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    FwUpdateReady = 0x0001,
    FwUpdateStatus = 0x0002,
    TimeSyncRequest = 0x0010,
    TimeSyncInfo = 0x0011,
    ApplianceForgetMe = 0x0013,
    OperationInfo = 0x0014,
    ApplianceParamsRequest = 0x0020,
    ApplianceParamsResponse = 0x0021,
    MultipleFrameRequest = 0x0030,
    MultipleFrameResponse = 0x0031,
}

impl FrameType {
    pub const ALL: [FrameType; 10] = [
        Self::FwUpdateReady,
        Self::FwUpdateStatus,
        Self::TimeSyncRequest,
        Self::TimeSyncInfo,
        Self::ApplianceForgetMe,
        Self::OperationInfo,
        Self::ApplianceParamsRequest,
        Self::ApplianceParamsResponse,
        Self::MultipleFrameRequest,
        Self::MultipleFrameResponse,
    ];

    pub const fn id(self) -> u16 {
        self as u16
    }

    pub fn tag_order(self) -> TagOrder {
        match self {
            Self::ApplianceParamsRequest
            | Self::ApplianceParamsResponse
            | Self::MultipleFrameRequest => TagOrder::Lsb,
            _ => TagOrder::Msb,
        }
    }

    /// Whether `frame` starts with this type's tag in this type's byte order.
    pub fn matches<F: Frame + ?Sized>(self, frame: &F) -> bool {
        let tag = match self.tag_order() {
            TagOrder::Msb => BigEndianU16::at(0).read(frame),
            TagOrder::Lsb => LittleEndianU16::at(0).read(frame),
        };
        frame.size() >= 2 && tag == self.id()
    }

    /// Probes every registered type in its own byte order.
    pub fn identify<F: Frame + ?Sized>(frame: &F) -> Option<Self> {
        Self::ALL.into_iter().find(|frame_type| frame_type.matches(frame))
    }
}

impl TryFrom<u16> for FrameType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|frame_type| frame_type.id() == value)
            .ok_or(value)
    }
}
