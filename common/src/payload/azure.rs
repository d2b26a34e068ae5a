//! Routes frames arriving on the `transferFrame` device method.

use log::{debug, info, warn};

use crate::frame::{Frame, FrameBuilderUser, FrameParser, FrameType};
use crate::payload::parameter::ParameterDataPayload;
use crate::payload::PayloadContext;
use crate::protocol::firmware::{FirmwareUpdateReady, FirmwareVersion};
use crate::protocol::multiple_frame::{MultipleFrameRequest, MultipleFrameResponse};
use crate::protocol::operation::{Operation, OperationInfo, OperationStatus};
use crate::protocol::parameter_data::{ParameterDataRequest, ParameterDataResponse};
use crate::protocol::time_sync::TimeSyncInfo;
use crate::protocol::transfer::{TransferFrameRequest, TransferFrameResponse};
use crate::types::ForgetMeState;

pub const TRANSFER_FRAME_METHOD: &str = "transferFrame";

pub const STATUS_OK: u16 = 200;
pub const STATUS_METHOD_NOT_ALLOWED: u16 = 405;
pub const STATUS_TIMEOUT: u16 = 408;

/// Receiver of firmware upgrade announcements.
pub trait FirmwareUpgradeControl: Send + Sync {
    fn set_url(&self, url: &str, version: FirmwareVersion);

    /// False when the upgrade is refused, e.g. after repeated failures.
    fn signal_upgrade_request(&self) -> bool;
}

/// Result of routing one frame.
#[derive(Debug)]
pub enum FrameOutcome {
    Response(FrameBuilderUser),
    /// Handled; nothing to send back.
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMethodResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl DeviceMethodResponse {
    fn json(status: u16, response: &TransferFrameResponse) -> Self {
        Self {
            status,
            body: response.to_json(),
        }
    }
}

pub struct AzurePayload<'a> {
    ctx: PayloadContext<'a>,
    firmware: &'a dyn FirmwareUpgradeControl,
}

impl<'a> AzurePayload<'a> {
    pub fn new(ctx: PayloadContext<'a>, firmware: &'a dyn FirmwareUpgradeControl) -> Self {
        Self { ctx, firmware }
    }

    /// Answers one cloud device-method call.
    pub fn handle_device_method(&self, method: &str, payload: &[u8]) -> DeviceMethodResponse {
        if method != TRANSFER_FRAME_METHOD {
            warn!("device method `{method}` not supported");
            return DeviceMethodResponse::json(
                STATUS_METHOD_NOT_ALLOWED,
                &TransferFrameResponse::empty(),
            );
        }

        let started_ms = self.ctx.clock.uptime_ms();
        let request = match TransferFrameRequest::parse(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!("dropping transfer frame: {err}");
                return DeviceMethodResponse::json(STATUS_OK, &TransferFrameResponse::empty());
            }
        };

        let response = match self.process_frame(&request.frame) {
            FrameOutcome::Response(frame) => {
                TransferFrameResponse::from_frame(&frame).unwrap_or_else(|err| {
                    warn!("cannot encode response frame: {err}");
                    TransferFrameResponse::empty()
                })
            }
            FrameOutcome::Accepted | FrameOutcome::Rejected => TransferFrameResponse::empty(),
        };

        let elapsed_ms = self.ctx.clock.uptime_ms().saturating_sub(started_ms);
        if elapsed_ms > u64::from(request.timeout_ms) {
            warn!(
                "transfer frame took {elapsed_ms} ms, caller gave {} ms",
                request.timeout_ms
            );
            return DeviceMethodResponse::json(STATUS_TIMEOUT, &TransferFrameResponse::empty());
        }
        DeviceMethodResponse::json(STATUS_OK, &response)
    }

    pub fn process_frame(&self, frame: &FrameParser) -> FrameOutcome {
        let Some(frame_type) = FrameType::identify(frame) else {
            warn!("unknown frame id {:#06x}", frame.id());
            return FrameOutcome::Rejected;
        };
        debug!("routing {frame_type:?} frame of {} bytes", frame.size());

        let handled = match frame_type {
            FrameType::MultipleFrameRequest => {
                return match self.process_multiple_frame(&MultipleFrameRequest::new(frame.clone())) {
                    Some(response) if response.num_of_sub_frames() > 0 => {
                        FrameOutcome::Response(response.into_frame())
                    }
                    Some(_) => FrameOutcome::Accepted,
                    None => FrameOutcome::Rejected,
                };
            }
            FrameType::FwUpdateReady => self.process_firmware_update_request(frame),
            FrameType::OperationInfo => self.process_operation_info(frame),
            FrameType::TimeSyncInfo => self.process_time_sync_info(frame),
            other => {
                warn!("{other:?} frames are not accepted from the cloud");
                false
            }
        };
        if handled {
            FrameOutcome::Accepted
        } else {
            FrameOutcome::Rejected
        }
    }

    /// `None` for an invalid envelope. A response without sub-frames means
    /// every item was a write.
    pub fn process_multiple_frame(&self, request: &MultipleFrameRequest) -> Option<MultipleFrameResponse> {
        if !request.is_valid() {
            warn!("invalid multiple frame request");
            return None;
        }

        let parameters = ParameterDataPayload::new(self.ctx);
        let mut response = MultipleFrameResponse::new();
        for (index, sub_frame) in request.sub_frames().enumerate() {
            let params = ParameterDataRequest::from_bytes(sub_frame);
            if !params.is_valid() {
                warn!("sub-frame {index} is not a valid parameter request");
                continue;
            }

            let mut answer = ParameterDataResponse::new();
            if parameters.process(&params, &mut answer) == 0 {
                continue;
            }
            if !answer.finalize() || !response.add_sub_frame(&answer) {
                warn!("answer to sub-frame {index} does not fit the response");
            }
        }
        Some(response)
    }

    pub fn process_firmware_update_request<F: Frame + ?Sized>(&self, frame: &F) -> bool {
        let Some(ready) = FirmwareUpdateReady::parse(frame) else {
            warn!("invalid firmware update request");
            return false;
        };

        info!("firmware {} available at {}", ready.version, ready.url);
        self.firmware.set_url(&ready.url, ready.version);
        if !self.firmware.signal_upgrade_request() {
            warn!("firmware upgrade request refused");
        }
        true
    }

    pub fn process_operation_info<F: Frame + ?Sized>(&self, frame: &F) -> bool {
        let Some(info) = OperationInfo::parse(frame) else {
            warn!("invalid operation info");
            return false;
        };

        match info.operation {
            Operation::ForgetMe if self.ctx.settings.forget_me() == ForgetMeState::Requested => {
                match info.status {
                    OperationStatus::Success => {
                        info!("cloud confirmed forget-me");
                        self.ctx.settings.set_forget_me(ForgetMeState::ResetConfirmed);
                    }
                    OperationStatus::Failure => {
                        warn!("cloud reported forget-me failure, retrying after reboot");
                    }
                }
            }
            Operation::ForgetMe => info!("ignoring forget-me result nobody asked for"),
        }
        true
    }

    pub fn process_time_sync_info<F: Frame + ?Sized>(&self, frame: &F) -> bool {
        let Some(info) = TimeSyncInfo::parse(frame) else {
            warn!("invalid time sync info");
            return false;
        };

        self.ctx.clock.set_unix_time(i64::from(info.unix_time));
        if self.ctx.settings.utc_offset_secs() != info.utc_offset_secs {
            info!("utc offset changed to {}s", info.utc_offset_secs);
            self.ctx.settings.set_utc_offset_secs(info.utc_offset_secs);
        }
        if let Some(now) = self.ctx.clock.now_local(info.utc_offset_secs) {
            self.ctx.settings.set_local_time(now);
        }
        true
    }
}
