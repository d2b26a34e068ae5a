//! Uploads appliance-side changes to the cloud as unsolicited frames.
//!
//! The cache holds the last values the cloud is known to have. Values the
//! cloud itself wrote are stored through the `update_*_from_cloud` methods so
//! they are not sent back; local changes are picked up by comparing settings
//! against the cache, and the cache only moves once the frame was queued.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::frame::FrameBuilderUser;
use crate::payload::parameter::{encode_override, ParameterId};
use crate::protocol::multiple_frame::MultipleFrameResponse;
use crate::protocol::operation::appliance_forget_me;
use crate::protocol::parameter_data::ParameterDataResponse;
use crate::protocol::time_sync::time_sync_request;
use crate::queue::Queue;
use crate::settings::Settings;
use crate::types::{ForgetMeState, Override, Temperature};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SyncedValues {
    comfort_setpoint: Option<Temperature>,
    eco_setpoint: Option<Temperature>,
    override_: Option<Override>,
    button_lock: Option<bool>,
}

#[derive(Debug, Default)]
pub struct SyncCache {
    values: Mutex<SyncedValues>,
}

impl SyncCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SyncedValues> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update_comfort_setpoint_from_cloud(&self, value: Temperature) {
        self.lock().comfort_setpoint = Some(value);
    }

    pub fn update_eco_setpoint_from_cloud(&self, value: Temperature) {
        self.lock().eco_setpoint = Some(value);
    }

    pub fn update_override_from_cloud(&self, value: Override) {
        self.lock().override_ = Some(value);
    }

    pub fn update_lock_status_from_cloud(&self, locked: bool) {
        self.lock().button_lock = Some(locked);
    }

    /// Forget everything so the next sync uploads the full state.
    pub fn invalidate(&self) {
        *self.lock() = SyncedValues::default();
    }
}

pub struct AzureSyncController {
    settings: Arc<dyn Settings>,
    cache: Arc<SyncCache>,
    outbox: Arc<Queue<FrameBuilderUser>>,
    was_connected: bool,
    time_sync_pending: bool,
    forget_me_sent: bool,
}

impl AzureSyncController {
    pub fn new(
        settings: Arc<dyn Settings>,
        cache: Arc<SyncCache>,
        outbox: Arc<Queue<FrameBuilderUser>>,
    ) -> Self {
        Self {
            settings,
            cache,
            outbox,
            was_connected: false,
            time_sync_pending: false,
            forget_me_sent: false,
        }
    }

    /// One sync pass; does nothing while the IoT-Hub session is down.
    pub fn tick(&mut self, iot_hub_connected: bool) {
        if !iot_hub_connected {
            self.was_connected = false;
            return;
        }
        if !self.was_connected {
            self.was_connected = true;
            self.time_sync_pending = true;
        }

        if self.time_sync_pending && self.outbox.push(time_sync_request()) {
            debug!("time sync request queued");
            self.time_sync_pending = false;
        }
        self.sync_forget_me();
        self.sync_parameters();
    }

    fn sync_forget_me(&mut self) {
        match self.settings.forget_me() {
            ForgetMeState::Requested if !self.forget_me_sent => {
                if self.outbox.push(appliance_forget_me()) {
                    info!("forget-me request queued");
                    self.forget_me_sent = true;
                }
            }
            ForgetMeState::NotRequested => self.forget_me_sent = false,
            _ => {}
        }
    }

    fn sync_parameters(&mut self) {
        let cached = *self.cache.lock();
        let current = SyncedValues {
            comfort_setpoint: Some(self.settings.comfort_setpoint()),
            eco_setpoint: Some(self.settings.eco_setpoint()),
            override_: Some(self.settings.active_override()),
            button_lock: Some(self.settings.button_lock()),
        };
        if current == cached {
            return;
        }

        let mut params = ParameterDataResponse::new();
        if current.comfort_setpoint != cached.comfort_setpoint {
            if let Some(value) = current.comfort_setpoint {
                params.add_parameter_data(ParameterId::ComfortSetpoint.id(), &[value.half_degrees()]);
            }
        }
        if current.eco_setpoint != cached.eco_setpoint {
            if let Some(value) = current.eco_setpoint {
                params.add_parameter_data(ParameterId::EcoSetpoint.id(), &[value.half_degrees()]);
            }
        }
        if current.override_ != cached.override_ {
            if let Some((id, data)) = current.override_.as_ref().and_then(encode_override) {
                params.add_parameter_data(id.id(), &data);
            }
        }
        if current.button_lock != cached.button_lock {
            if let Some(locked) = current.button_lock {
                params.add_parameter_data(ParameterId::LockStatus.id(), &[u8::from(locked)]);
            }
        }
        if params.num_of_param_data() == 0 || !params.finalize() {
            return;
        }

        let mut frame = MultipleFrameResponse::new();
        if !frame.add_sub_frame(&params) {
            warn!("sync frame could not be assembled");
            return;
        }
        if !self.outbox.push(frame.into_frame()) {
            debug!("outbox full, retrying sync next pass");
            return;
        }

        debug!("queued {} changed parameters", params.num_of_param_data());
        *self.cache.lock() = current;
    }
}
