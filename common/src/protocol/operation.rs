use log::debug;

use crate::frame::{Frame, FrameBuilder, FrameBuilderUser, FrameType};

const INFO_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ForgetMe,
}

impl Operation {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ForgetMe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Success,
    Failure,
}

impl OperationStatus {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Cloud verdict on an operation the appliance started:
/// `[0x00 0x14][operation][status]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationInfo {
    pub operation: Operation,
    pub status: OperationStatus,
}

impl OperationInfo {
    pub fn parse<F: Frame + ?Sized>(frame: &F) -> Option<Self> {
        if !FrameType::OperationInfo.matches(frame) || frame.size() != INFO_SIZE {
            debug!("operation info rejected: {} bytes", frame.size());
            return None;
        }
        let bytes = frame.as_bytes();
        let Some(operation) = Operation::from_wire(bytes[2]) else {
            debug!("unknown operation {}", bytes[2]);
            return None;
        };
        let Some(status) = OperationStatus::from_wire(bytes[3]) else {
            debug!("unknown operation status {}", bytes[3]);
            return None;
        };
        Some(Self { operation, status })
    }
}

/// Unlink request sent once the user asked to forget this appliance.
pub fn appliance_forget_me() -> FrameBuilderUser {
    let mut builder: FrameBuilder = FrameBuilder::new();
    builder.add_u16_msb(FrameType::ApplianceForgetMe.id());
    builder.into()
}
