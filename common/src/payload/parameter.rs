//! Applies parameter items from the cloud to the appliance settings.

use chrono::{Datelike, NaiveDate, TimeDelta, Timelike};
use log::{debug, info, warn};

use crate::payload::PayloadContext;
use crate::protocol::parameter_data::{ParameterDataRequest, ParameterDataResponse};
use crate::types::{DayOfWeek, DayProgram, HeatingMode, Override, OverrideType, Temperature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterId {
    DeviceDetails,
    ComfortSetpoint,
    EcoSetpoint,
    ActiveSetpoint,
    WeekProgramMonTue,
    WeekProgramWedThu,
    WeekProgramFriSat,
    WeekProgramSun,
    WeekProgramActivation,
    NowConstantOverride,
    TimedOverride,
    LockStatus,
}

impl ParameterId {
    pub const ALL: [ParameterId; 12] = [
        Self::DeviceDetails,
        Self::ComfortSetpoint,
        Self::EcoSetpoint,
        Self::ActiveSetpoint,
        Self::WeekProgramMonTue,
        Self::WeekProgramWedThu,
        Self::WeekProgramFriSat,
        Self::WeekProgramSun,
        Self::WeekProgramActivation,
        Self::NowConstantOverride,
        Self::TimedOverride,
        Self::LockStatus,
    ];

    pub fn id(self) -> u16 {
        match self {
            Self::DeviceDetails => 0x0001,
            Self::ComfortSetpoint => 0x0101,
            Self::EcoSetpoint => 0x0102,
            Self::ActiveSetpoint => 0x0103,
            Self::WeekProgramMonTue => 0x0201,
            Self::WeekProgramWedThu => 0x0202,
            Self::WeekProgramFriSat => 0x0203,
            Self::WeekProgramSun => 0x0204,
            Self::WeekProgramActivation => 0x0210,
            Self::NowConstantOverride => 0x0301,
            Self::TimedOverride => 0x0302,
            Self::LockStatus => 0x0401,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|param| param.id() == id)
    }

    /// Days carried in the two blocks of a week program parameter.
    fn week_days(self) -> Option<(DayOfWeek, Option<DayOfWeek>)> {
        match self {
            Self::WeekProgramMonTue => Some((DayOfWeek::Mon, Some(DayOfWeek::Tue))),
            Self::WeekProgramWedThu => Some((DayOfWeek::Wed, Some(DayOfWeek::Thu))),
            Self::WeekProgramFriSat => Some((DayOfWeek::Fri, Some(DayOfWeek::Sat))),
            Self::WeekProgramSun => Some((DayOfWeek::Sun, None)),
            _ => None,
        }
    }
}

const READ_REQUEST: u8 = 0xff;
const NOW_CONSTANT_LEN: usize = 3;
const TIMED_LEN: usize = 12;
const WEEK_PROGRAM_LEN: usize = 2 * DayProgram::BLOCK_SIZE;
const FLAG_NOW: u8 = 0;
const FLAG_CONSTANT: u8 = 1;
const YEAR_BASE: i32 = 2000;

type Read = fn(&PayloadContext<'_>, ParameterId) -> Vec<u8>;
type Write = fn(&PayloadContext<'_>, ParameterId, &[u8]);

/// How a parameter reacts to an item: reads answer, writes stay silent.
#[derive(Clone, Copy)]
enum Access {
    ReadOnly(Read),
    WriteOnly(Write),
    ReadWrite { read: Read, write: Write },
}

#[derive(Clone, Copy)]
struct ParameterHandler {
    id: ParameterId,
    access: Access,
}

const HANDLERS: [ParameterHandler; 12] = [
    ParameterHandler {
        id: ParameterId::DeviceDetails,
        access: Access::ReadOnly(read_device_details),
    },
    ParameterHandler {
        id: ParameterId::ComfortSetpoint,
        access: Access::ReadWrite {
            read: read_setpoint,
            write: write_setpoint,
        },
    },
    ParameterHandler {
        id: ParameterId::EcoSetpoint,
        access: Access::ReadWrite {
            read: read_setpoint,
            write: write_setpoint,
        },
    },
    ParameterHandler {
        id: ParameterId::ActiveSetpoint,
        access: Access::ReadOnly(read_active_setpoint),
    },
    ParameterHandler {
        id: ParameterId::WeekProgramMonTue,
        access: Access::ReadWrite {
            read: read_week_program,
            write: write_week_program,
        },
    },
    ParameterHandler {
        id: ParameterId::WeekProgramWedThu,
        access: Access::ReadWrite {
            read: read_week_program,
            write: write_week_program,
        },
    },
    ParameterHandler {
        id: ParameterId::WeekProgramFriSat,
        access: Access::ReadWrite {
            read: read_week_program,
            write: write_week_program,
        },
    },
    ParameterHandler {
        id: ParameterId::WeekProgramSun,
        access: Access::ReadWrite {
            read: read_week_program,
            write: write_week_program,
        },
    },
    ParameterHandler {
        id: ParameterId::WeekProgramActivation,
        access: Access::WriteOnly(activate_week_program),
    },
    ParameterHandler {
        id: ParameterId::NowConstantOverride,
        access: Access::ReadWrite {
            read: read_now_constant_override,
            write: write_now_constant_override,
        },
    },
    ParameterHandler {
        id: ParameterId::TimedOverride,
        access: Access::ReadWrite {
            read: read_timed_override,
            write: write_timed_override,
        },
    },
    ParameterHandler {
        id: ParameterId::LockStatus,
        access: Access::ReadWrite {
            read: read_lock_status,
            write: write_lock_status,
        },
    },
];

fn is_read_request(data: &[u8]) -> bool {
    data.is_empty() || data == [READ_REQUEST]
}

pub struct ParameterDataPayload<'a> {
    ctx: PayloadContext<'a>,
}

impl<'a> ParameterDataPayload<'a> {
    pub fn new(ctx: PayloadContext<'a>) -> Self {
        Self { ctx }
    }

    /// Handles every item of `request` and returns how many answers were
    /// added to `response`. Zero is a normal outcome for pure writes.
    pub fn process(&self, request: &ParameterDataRequest, response: &mut ParameterDataResponse) -> usize {
        let mut answered = 0;
        for item in request.items() {
            let Some(handler) = ParameterId::from_id(item.id)
                .and_then(|id| HANDLERS.iter().find(|handler| handler.id == id))
            else {
                debug!("skipping unknown parameter {:#06x}", item.id);
                continue;
            };

            let reply = match handler.access {
                Access::ReadOnly(read) => Some(read(&self.ctx, handler.id)),
                Access::WriteOnly(write) => {
                    write(&self.ctx, handler.id, item.data);
                    None
                }
                Access::ReadWrite { read, .. } if is_read_request(item.data) => {
                    Some(read(&self.ctx, handler.id))
                }
                Access::ReadWrite { write, .. } => {
                    write(&self.ctx, handler.id, item.data);
                    None
                }
            };

            if let Some(reply) = reply {
                if response.add_parameter_data(item.id, &reply) {
                    answered += 1;
                } else {
                    warn!("no room to answer parameter {:#06x}", item.id);
                }
            }
        }
        answered
    }
}

fn read_device_details(ctx: &PayloadContext<'_>, _: ParameterId) -> Vec<u8> {
    let mut reply = ctx.device.company_code().to_le_bytes().to_vec();
    match ctx.device.gdid_bcd() {
        Some(bcd) => reply.extend(bcd),
        None => warn!("gdid `{}` is not decimal", ctx.device.gdid()),
    }
    reply
}

fn read_setpoint(ctx: &PayloadContext<'_>, id: ParameterId) -> Vec<u8> {
    let value = match id {
        ParameterId::EcoSetpoint => ctx.settings.eco_setpoint(),
        _ => ctx.settings.comfort_setpoint(),
    };
    vec![value.half_degrees()]
}

fn write_setpoint(ctx: &PayloadContext<'_>, id: ParameterId, data: &[u8]) {
    let Some(value) = (data.len() == 1)
        .then(|| Temperature::from_half_degrees(data[0]))
        .flatten()
    else {
        warn!("ignoring setpoint {data:02x?} for {id:?}");
        return;
    };
    match id {
        ParameterId::EcoSetpoint => {
            ctx.settings.set_eco_setpoint(value);
            ctx.sync.update_eco_setpoint_from_cloud(value);
        }
        _ => {
            ctx.settings.set_comfort_setpoint(value);
            ctx.sync.update_comfort_setpoint_from_cloud(value);
        }
    }
    info!("{id:?} set to {:.1}C", value.celsius());
}

fn read_active_setpoint(ctx: &PayloadContext<'_>, _: ParameterId) -> Vec<u8> {
    let value = match ctx.settings.heating_mode() {
        HeatingMode::Comfort => ctx.settings.comfort_setpoint().half_degrees(),
        HeatingMode::Eco => ctx.settings.eco_setpoint().half_degrees(),
        HeatingMode::AntiFrost => Temperature::ANTI_FROST.half_degrees(),
        HeatingMode::Shutdown => Temperature::NO_VALUE,
    };
    vec![value]
}

fn read_week_program(ctx: &PayloadContext<'_>, id: ParameterId) -> Vec<u8> {
    let mut reply = vec![0xff; WEEK_PROGRAM_LEN];
    if let Some((first, second)) = id.week_days() {
        reply[..DayProgram::BLOCK_SIZE]
            .copy_from_slice(&ctx.settings.day_program(first).to_block());
        if let Some(second) = second {
            reply[DayProgram::BLOCK_SIZE..]
                .copy_from_slice(&ctx.settings.day_program(second).to_block());
        }
    }
    reply
}

/// Each block is checked on its own; a bad or untouched first day does
/// not stop the second.
fn write_week_program(ctx: &PayloadContext<'_>, id: ParameterId, data: &[u8]) {
    let Some((first, second)) = id.week_days() else {
        return;
    };
    if data.len() != WEEK_PROGRAM_LEN {
        warn!("week program item for {id:?} carries {} bytes", data.len());
        return;
    }
    let (first_block, second_block) = data.split_at(DayProgram::BLOCK_SIZE);
    for (day, block) in [(Some(first), first_block), (second, second_block)] {
        let Some(day) = day else {
            continue;
        };
        match DayProgram::from_block(block) {
            Some(program) => {
                debug!("{day:?} program updated with {} points", program.points.len());
                ctx.settings.set_day_program(day, program);
            }
            None => debug!("{day:?} program left untouched"),
        }
    }
}

fn activate_week_program(ctx: &PayloadContext<'_>, _: ParameterId, _: &[u8]) {
    let value = Override::none();
    ctx.settings.set_override(value);
    ctx.sync.update_override_from_cloud(value);
    info!("week program activated");
}

fn read_now_constant_override(ctx: &PayloadContext<'_>, _: ParameterId) -> Vec<u8> {
    let current = ctx.settings.active_override();
    match encode_now_constant(&current) {
        Some(bytes) => bytes.to_vec(),
        None => vec![current.mode.to_wire(), FLAG_NOW, 0],
    }
}

fn write_now_constant_override(ctx: &PayloadContext<'_>, _: ParameterId, data: &[u8]) {
    let [mode, flag, activate] = data else {
        warn!("now/constant override carries {} bytes", data.len());
        return;
    };
    let kind = match *flag {
        FLAG_NOW => OverrideType::Now,
        FLAG_CONSTANT => OverrideType::Constant,
        other => {
            warn!("unknown override flag {other}");
            return;
        }
    };

    if *activate == 0 {
        if ctx.settings.active_override().kind == kind {
            apply_override(ctx, Override::none());
        }
        return;
    }

    let Some(mode) = HeatingMode::from_wire(*mode) else {
        debug!("ignoring {kind:?} override with unknown mode {mode}");
        return;
    };
    let value = match kind {
        OverrideType::Constant if mode == HeatingMode::Shutdown => {
            debug!("ignoring constant shutdown override");
            return;
        }
        OverrideType::Constant => Override::constant(mode),
        _ => Override::now(mode),
    };
    apply_override(ctx, value);
}

fn read_timed_override(ctx: &PayloadContext<'_>, _: ParameterId) -> Vec<u8> {
    let current = ctx.settings.active_override();
    match encode_timed(&current) {
        Some(bytes) => bytes.to_vec(),
        None => {
            let mut reply = vec![0; TIMED_LEN];
            reply[0] = current.mode.to_wire();
            reply
        }
    }
}

/// `[mode][activate][day][month][year-2000][weekday][utc offset i32 LSB][hour][minute]`
fn write_timed_override(ctx: &PayloadContext<'_>, _: ParameterId, data: &[u8]) {
    let Ok(bytes) = <[u8; TIMED_LEN]>::try_from(data) else {
        warn!("timed override carries {} bytes", data.len());
        return;
    };

    if bytes[1] == 0 {
        if ctx.settings.active_override().kind == OverrideType::Timed {
            apply_override(ctx, Override::none());
        }
        return;
    }

    let Some(mode) = HeatingMode::from_wire(bytes[0]) else {
        debug!("ignoring timed override with unknown mode {}", bytes[0]);
        return;
    };
    let utc_offset = i32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let Some(local_end) = NaiveDate::from_ymd_opt(
        YEAR_BASE + i32::from(bytes[4]),
        u32::from(bytes[3]),
        u32::from(bytes[2]),
    )
    .and_then(|date| date.and_hms_opt(u32::from(bytes[10]), u32::from(bytes[11]), 0)) else {
        warn!("timed override end {bytes:02x?} is not a valid date");
        return;
    };

    // The end instant is the wall time read as UTC, shifted forward by the offset.
    let wall_as_utc = ctx.clock.local_to_unix(local_end);
    let Some(end) = ctx
        .clock
        .unix_to_local(wall_as_utc + i64::from(utc_offset), utc_offset)
    else {
        warn!("timed override offset {utc_offset}s out of range");
        return;
    };
    apply_override(ctx, Override::timed(mode, end));
}

fn read_lock_status(ctx: &PayloadContext<'_>, _: ParameterId) -> Vec<u8> {
    vec![u8::from(ctx.settings.button_lock())]
}

fn write_lock_status(ctx: &PayloadContext<'_>, _: ParameterId, data: &[u8]) {
    let locked = match data {
        [0] => false,
        [1] => true,
        _ => {
            warn!("ignoring lock status {data:02x?}");
            return;
        }
    };
    ctx.settings.set_button_lock(locked);
    ctx.sync.update_lock_status_from_cloud(locked);
    info!("button lock {}", if locked { "enabled" } else { "disabled" });
}

fn apply_override(ctx: &PayloadContext<'_>, value: Override) {
    ctx.settings.set_override(value);
    ctx.sync.update_override_from_cloud(value);
    info!("override set to {:?} {}", value.kind, value.mode.as_str());
}

pub fn encode_now_constant(value: &Override) -> Option<[u8; NOW_CONSTANT_LEN]> {
    let flag = match value.kind {
        OverrideType::Now => FLAG_NOW,
        OverrideType::Constant => FLAG_CONSTANT,
        _ => return None,
    };
    Some([value.mode.to_wire(), flag, 1])
}

pub fn encode_timed(value: &Override) -> Option<[u8; TIMED_LEN]> {
    let stored = value.end.filter(|_| value.kind == OverrideType::Timed)?;
    let utc_offset = stored.offset().local_minus_utc();
    let end = stored.naive_utc() - TimeDelta::seconds(i64::from(utc_offset));
    let year = u8::try_from(end.year() - YEAR_BASE).ok()?;
    let offset = utc_offset.to_le_bytes();
    Some([
        value.mode.to_wire(),
        1,
        end.day() as u8,
        end.month() as u8,
        year,
        end.weekday().num_days_from_monday() as u8,
        offset[0],
        offset[1],
        offset[2],
        offset[3],
        end.hour() as u8,
        end.minute() as u8,
    ])
}

/// Item that reports `value` to the cloud.
pub fn encode_override(value: &Override) -> Option<(ParameterId, Vec<u8>)> {
    match value.kind {
        OverrideType::None => Some((ParameterId::WeekProgramActivation, vec![1])),
        OverrideType::Now | OverrideType::Constant => {
            encode_now_constant(value).map(|bytes| (ParameterId::NowConstantOverride, bytes.to_vec()))
        }
        OverrideType::Timed => {
            encode_timed(value).map(|bytes| (ParameterId::TimedOverride, bytes.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::payload::sync::SyncCache;
    use crate::settings::{DeviceMeta, MemorySettings, Settings};
    use crate::time::AdjustableClock;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    struct Fixture {
        settings: MemorySettings,
        device: DeviceMeta,
        clock: AdjustableClock,
        sync: SyncCache,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                settings: MemorySettings::default(),
                device: DeviceMeta::new(&DeviceConfig {
                    gdid: "1234".to_string(),
                    company_code: 0x0102,
                    ..DeviceConfig::default()
                }),
                clock: AdjustableClock::new(),
                sync: SyncCache::new(),
            }
        }

        fn run(&self, items: &[(u16, &[u8])]) -> (usize, Vec<u8>) {
            let mut bytes = vec![0x20, 0x00];
            for (id, data) in items {
                bytes.extend(id.to_le_bytes());
                bytes.push(data.len() as u8);
                bytes.extend_from_slice(data);
            }
            bytes.extend([0x00, 0x00]);
            let request = ParameterDataRequest::from_bytes(&bytes);
            assert!(request.is_valid());

            let payload = ParameterDataPayload::new(PayloadContext {
                settings: &self.settings,
                device: &self.device,
                clock: &self.clock,
                sync: &self.sync,
            });
            let mut response = ParameterDataResponse::new();
            let count = payload.process(&request, &mut response);
            (count, crate::frame::Frame::as_bytes(&response).to_vec())
        }
    }

    #[test]
    fn setpoint_read_and_write() {
        let fixture = Fixture::new();

        let (count, _) = fixture.run(&[(0x0101, &[45])]);
        assert_eq!(count, 0);
        assert_eq!(fixture.settings.comfort_setpoint().half_degrees(), 45);

        let (count, bytes) = fixture.run(&[(0x0101, &[0xff]), (0x0102, &[])]);
        assert_eq!(count, 2);
        assert_eq!(
            bytes,
            vec![0x21, 0x00, 0x01, 0x01, 1, 45, 0x02, 0x01, 1, 34]
        );
    }

    #[test]
    fn out_of_range_setpoint_is_ignored() {
        let fixture = Fixture::new();

        fixture.run(&[(0x0101, &[200])]);

        assert_eq!(fixture.settings.comfort_setpoint().half_degrees(), 42);
    }

    #[test]
    fn device_details_answer_company_and_bcd_gdid() {
        let fixture = Fixture::new();

        let (count, bytes) = fixture.run(&[(0x0001, &[])]);

        assert_eq!(count, 1);
        assert_eq!(&bytes[2..], &[0x01, 0x00, 4, 0x02, 0x01, 0x12, 0x34]);
    }

    #[test]
    fn active_setpoint_follows_heating_mode() {
        let fixture = Fixture::new();
        let read = |mode| {
            fixture.settings.set_heating_mode(mode);
            fixture.run(&[(0x0103, &[])]).1[5]
        };

        assert_eq!(read(HeatingMode::Comfort), 42);
        assert_eq!(read(HeatingMode::Eco), 34);
        assert_eq!(read(HeatingMode::AntiFrost), Temperature::ANTI_FROST.half_degrees());
        assert_eq!(read(HeatingMode::Shutdown), 0xff);
    }

    #[test]
    fn week_program_blocks_apply_independently() {
        let fixture = Fixture::new();
        let mut data = [0xffu8; WEEK_PROGRAM_LEN];
        data[20..24].copy_from_slice(&[36, 0, 132, 1]);

        fixture.run(&[(0x0201, &data)]);

        assert!(fixture.settings.day_program(DayOfWeek::Mon).points.is_empty());
        assert_eq!(fixture.settings.day_program(DayOfWeek::Tue).points.len(), 2);

        let (_, bytes) = fixture.run(&[(0x0201, &[])]);
        assert_eq!(&bytes[5..], &data[..]);
    }

    #[test]
    fn constant_shutdown_and_unknown_modes_are_ignored() {
        let fixture = Fixture::new();

        fixture.run(&[(0x0301, &[3, FLAG_CONSTANT, 1])]);
        fixture.run(&[(0x0301, &[9, FLAG_NOW, 1])]);
        assert_eq!(fixture.settings.active_override(), Override::none());

        fixture.run(&[(0x0301, &[3, FLAG_NOW, 1])]);
        assert_eq!(fixture.settings.active_override(), Override::now(HeatingMode::Shutdown));
    }

    #[test]
    fn deactivate_only_clears_matching_kind() {
        let fixture = Fixture::new();
        fixture.settings.set_override(Override::constant(HeatingMode::Eco));

        fixture.run(&[(0x0301, &[1, FLAG_NOW, 0])]);
        assert_eq!(fixture.settings.active_override().kind, OverrideType::Constant);

        fixture.run(&[(0x0301, &[1, FLAG_CONSTANT, 0])]);
        assert_eq!(fixture.settings.active_override(), Override::none());
    }

    #[test]
    fn timed_override_end_is_shifted_forward_by_offset() {
        let fixture = Fixture::new();
        let offset = 7200i32.to_le_bytes();
        let data = [
            1, 1, 15, 6, 24, 5, offset[0], offset[1], offset[2], offset[3], 21, 30,
        ];

        fixture.run(&[(0x0302, &data)]);

        let value = fixture.settings.active_override();
        let end = value.end.unwrap();
        assert_eq!(value.kind, OverrideType::Timed);
        assert_eq!(value.mode, HeatingMode::Eco);
        let wall = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap().and_hms_opt(21, 30, 0).unwrap();
        assert_eq!(end.timestamp(), wall.and_utc().timestamp() + 7200);
        assert_eq!(end.offset().local_minus_utc(), 7200);
        assert_eq!(encode_timed(&value), Some(data));
    }

    #[test]
    fn week_program_activation_clears_override_and_updates_cache() {
        let fixture = Fixture::new();
        fixture.settings.set_override(Override::now(HeatingMode::Eco));

        let (count, _) = fixture.run(&[(0x0210, &[1])]);

        assert_eq!(count, 0);
        assert_eq!(fixture.settings.active_override(), Override::none());
    }

    #[test]
    fn unknown_parameters_are_skipped() {
        let fixture = Fixture::new();

        let (count, bytes) = fixture.run(&[(0x7777, &[1, 2]), (0x0401, &[])]);

        assert_eq!(count, 1);
        assert_eq!(&bytes[2..], &[0x01, 0x04, 1, 0]);
    }

    #[test]
    fn lock_status_write() {
        let fixture = Fixture::new();

        fixture.run(&[(0x0401, &[1])]);

        assert!(fixture.settings.button_lock());
    }
}
