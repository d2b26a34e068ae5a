//! Appliance settings shared between tasks.
//!
//! Every accessor takes the internal lock for that one call only; a read
//! followed by a write is not atomic against other writers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset};

use crate::config::{DeviceConfig, PersistedSettings};
use crate::protocol::firmware::FirmwareVersion;
use crate::types::{
    DayOfWeek, DayProgram, ForgetMeState, HeatingMode, Override, Temperature, WifiCredentials,
};

pub trait Settings: Send + Sync {
    fn comfort_setpoint(&self) -> Temperature;
    fn set_comfort_setpoint(&self, value: Temperature);

    fn eco_setpoint(&self) -> Temperature;
    fn set_eco_setpoint(&self, value: Temperature);

    fn heating_mode(&self) -> HeatingMode;
    fn set_heating_mode(&self, mode: HeatingMode);

    fn active_override(&self) -> Override;
    fn set_override(&self, value: Override);

    fn button_lock(&self) -> bool;
    fn set_button_lock(&self, locked: bool);

    fn utc_offset_secs(&self) -> i32;
    fn set_utc_offset_secs(&self, offset: i32);

    fn day_program(&self, day: DayOfWeek) -> DayProgram;
    fn set_day_program(&self, day: DayOfWeek, program: DayProgram);

    fn forget_me(&self) -> ForgetMeState;
    fn set_forget_me(&self, state: ForgetMeState);

    fn fw_upgrade_failures(&self) -> u8;
    fn set_fw_upgrade_failures(&self, count: u8);

    fn wifi_credentials(&self) -> WifiCredentials;
    fn set_wifi_credentials(&self, credentials: WifiCredentials);

    /// Local time the heat controller runs the week program against.
    fn local_time(&self) -> Option<DateTime<FixedOffset>>;
    fn set_local_time(&self, now: DateTime<FixedOffset>);

    /// Restores factory defaults, keeping nothing the user configured.
    fn factory_reset(&self);
}

#[derive(Debug, Clone, Default)]
struct SettingsState {
    persisted: PersistedSettings,
    wifi: WifiCredentials,
    local_time: Option<DateTime<FixedOffset>>,
}

/// In-memory [`Settings`] with a dirty flag the runtime uses to persist.
#[derive(Debug, Default)]
pub struct MemorySettings {
    state: Mutex<SettingsState>,
    dirty: AtomicBool,
}

impl MemorySettings {
    pub fn new(persisted: PersistedSettings, wifi: WifiCredentials) -> Self {
        Self {
            state: Mutex::new(SettingsState {
                persisted,
                wifi,
                local_time: None,
            }),
            dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SettingsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, apply: impl FnOnce(&mut SettingsState)) {
        apply(&mut self.lock());
        self.dirty.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> (PersistedSettings, WifiCredentials) {
        let state = self.lock();
        (state.persisted.clone(), state.wifi.clone())
    }

    /// True once per batch of changes.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

impl Settings for MemorySettings {
    fn comfort_setpoint(&self) -> Temperature {
        self.lock().persisted.comfort_setpoint
    }

    fn set_comfort_setpoint(&self, value: Temperature) {
        self.update(|state| state.persisted.comfort_setpoint = value);
    }

    fn eco_setpoint(&self) -> Temperature {
        self.lock().persisted.eco_setpoint
    }

    fn set_eco_setpoint(&self, value: Temperature) {
        self.update(|state| state.persisted.eco_setpoint = value);
    }

    fn heating_mode(&self) -> HeatingMode {
        self.lock().persisted.heating_mode
    }

    fn set_heating_mode(&self, mode: HeatingMode) {
        self.update(|state| state.persisted.heating_mode = mode);
    }

    fn active_override(&self) -> Override {
        self.lock().persisted.override_
    }

    fn set_override(&self, value: Override) {
        self.update(|state| state.persisted.override_ = value);
    }

    fn button_lock(&self) -> bool {
        self.lock().persisted.button_lock
    }

    fn set_button_lock(&self, locked: bool) {
        self.update(|state| state.persisted.button_lock = locked);
    }

    fn utc_offset_secs(&self) -> i32 {
        self.lock().persisted.utc_offset_secs
    }

    fn set_utc_offset_secs(&self, offset: i32) {
        self.update(|state| state.persisted.utc_offset_secs = offset);
    }

    fn day_program(&self, day: DayOfWeek) -> DayProgram {
        self.lock()
            .persisted
            .week_program
            .get(day.index())
            .cloned()
            .unwrap_or_default()
    }

    fn set_day_program(&self, day: DayOfWeek, program: DayProgram) {
        self.update(|state| {
            let week = &mut state.persisted.week_program;
            if week.len() < DayOfWeek::ALL.len() {
                week.resize(DayOfWeek::ALL.len(), DayProgram::default());
            }
            week[day.index()] = program;
        });
    }

    fn forget_me(&self) -> ForgetMeState {
        self.lock().persisted.forget_me
    }

    fn set_forget_me(&self, forget_me: ForgetMeState) {
        self.update(|state| state.persisted.forget_me = forget_me);
    }

    fn fw_upgrade_failures(&self) -> u8 {
        self.lock().persisted.fw_upgrade_failures
    }

    fn set_fw_upgrade_failures(&self, count: u8) {
        self.update(|state| state.persisted.fw_upgrade_failures = count);
    }

    fn wifi_credentials(&self) -> WifiCredentials {
        self.lock().wifi.clone()
    }

    fn set_wifi_credentials(&self, credentials: WifiCredentials) {
        self.update(|state| state.wifi = credentials);
    }

    fn local_time(&self) -> Option<DateTime<FixedOffset>> {
        self.lock().local_time
    }

    fn set_local_time(&self, now: DateTime<FixedOffset>) {
        self.lock().local_time = Some(now);
    }

    fn factory_reset(&self) {
        self.update(|state| {
            state.persisted = PersistedSettings::default();
            state.wifi = WifiCredentials::default();
        });
    }
}

/// Identity and version data fixed at manufacturing time.
#[derive(Debug, Clone)]
pub struct DeviceMeta {
    gdid: String,
    company_code: u16,
    firmware_version: FirmwareVersion,
    bt_passkey: u32,
    direct_appliance: bool,
}

impl DeviceMeta {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            gdid: config.gdid.clone(),
            company_code: config.company_code,
            firmware_version: config.firmware_version,
            bt_passkey: config.bt_passkey,
            direct_appliance: config.direct_appliance,
        }
    }

    pub fn gdid(&self) -> &str {
        &self.gdid
    }

    /// GDID digits packed two per byte, high nibble first; an odd digit
    /// count gets a leading zero nibble. Non-digits yield `None`.
    pub fn gdid_bcd(&self) -> Option<Vec<u8>> {
        let mut nibbles = self
            .gdid
            .chars()
            .map(|digit| digit.to_digit(10).map(|value| value as u8))
            .collect::<Option<Vec<u8>>>()?;
        if nibbles.len() % 2 == 1 {
            nibbles.insert(0, 0);
        }
        Some(
            nibbles
                .chunks_exact(2)
                .map(|pair| (pair[0] << 4) | pair[1])
                .collect(),
        )
    }

    pub fn company_code(&self) -> u16 {
        self.company_code
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.firmware_version
    }

    pub fn bt_passkey(&self) -> u32 {
        self.bt_passkey
    }

    pub fn is_direct_appliance(&self) -> bool {
        self.direct_appliance
    }
}
