//! Typed frames layered on the byte codec.

pub mod firmware;
pub mod multiple_frame;
pub mod operation;
pub mod parameter_data;
pub mod time_sync;
pub mod transfer;

pub use firmware::{FirmwareFailureReason, FirmwareUpdateReady, FirmwareUpdateStatus, FirmwareVersion};
pub use multiple_frame::{MultipleFrameRequest, MultipleFrameResponse};
pub use operation::{Operation, OperationInfo, OperationStatus};
pub use parameter_data::{ParameterData, ParameterDataRequest, ParameterDataResponse};
pub use time_sync::TimeSyncInfo;
pub use transfer::{TransferFrameRequest, TransferFrameResponse};
