use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::value::Quantity;

/// Desired value for a (device, type) declared by a schedule or override.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTarget {
    pub home: String,
    pub zone: String,
    pub device: String,
    pub reading_type: String,
    pub value: Quantity,
}

impl DeviceTarget {
    pub fn from_config(config: DeviceTargetConfig, default_home: &str, default_zone: &str) -> Self {
        Self {
            home: config.home.unwrap_or_else(|| default_home.to_string()),
            zone: config.zone.unwrap_or_else(|| default_zone.to_string()),
            device: config.device,
            reading_type: config.reading_type,
            value: config.value,
        }
    }

    pub fn matches(&self, home: &str, zone: &str, device: &str, reading_type: &str) -> bool {
        self.home == home
            && self.zone == zone
            && self.device == device
            && (self.reading_type.is_empty() || self.reading_type == reading_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceTargetConfig {
    pub home: Option<String>,
    pub zone: Option<String>,
    #[serde(default)]
    pub device: String,
    #[serde(rename = "type", default)]
    pub reading_type: String,
    #[serde(default)]
    pub value: Quantity,
}

/// Weekly recurring target set. Bit `k` of `days` is weekday `k`, with
/// Sunday at bit 0. A schedule has no end time: it stays in force until a
/// later one takes over, or until midnight.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub days: u8,
    pub hour: u8,
    pub minute: u8,
    targets: Vec<DeviceTarget>,
}

impl Schedule {
    /// Returns `None` when the start time cannot be parsed; a missing start
    /// means midnight.
    pub fn from_config(
        config: ScheduleConfig,
        default_home: &str,
        default_zone: &str,
    ) -> Option<Self> {
        let (hour, minute) = match config.start {
            Some(start) => parse_start(&start)?,
            None => (0, 0),
        };

        let mut days = 0u8;
        for day in config.days {
            if (0..=6).contains(&day) {
                days |= 1 << day;
            }
        }

        Some(Self {
            days,
            hour,
            minute,
            targets: config
                .changes
                .into_iter()
                .map(|target| DeviceTarget::from_config(target, default_home, default_zone))
                .collect(),
        })
    }

    pub fn start_key(&self) -> (u8, u8) {
        (self.hour, self.minute)
    }

    pub fn is_active_at(&self, weekday: u8, hour: u8, minute: u8) -> bool {
        self.days & (1 << weekday) != 0 && (self.hour, self.minute) <= (hour, minute)
    }

    /// The last matching target in the declared list wins.
    pub fn target_for(
        &self,
        home: &str,
        zone: &str,
        device: &str,
        reading_type: &str,
    ) -> Option<&DeviceTarget> {
        self.targets
            .iter()
            .rev()
            .find(|target| target.matches(home, zone, device, reading_type))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub days: Vec<i64>,
    pub start: Option<String>,
    #[serde(default)]
    pub changes: Vec<DeviceTargetConfig>,
}

fn parse_start(start: &str) -> Option<(u8, u8)> {
    let mut parts = start.split(':');
    let hour: u8 = parts.next()?.parse().ok()?;
    let minute: u8 = match parts.next() {
        Some(minute) => minute.parse().ok()?,
        None => 0,
    };

    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Absolute time window beating every schedule while it is active.
#[derive(Debug, Clone)]
pub struct Override {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    targets: Vec<DeviceTarget>,
}

impl Override {
    /// Returns `None` when the window cannot be parsed; a missing end
    /// collapses the window to its start instant.
    pub fn from_config(
        config: OverrideConfig,
        default_home: &str,
        default_zone: &str,
    ) -> Option<Self> {
        let start = parse_instant(config.start.as_deref()?)?;
        let end = match config.end {
            Some(end) => parse_instant(&end)?,
            None => start,
        };

        Some(Self {
            start,
            end,
            targets: config
                .changes
                .into_iter()
                .map(|target| DeviceTarget::from_config(target, default_home, default_zone))
                .collect(),
        })
    }

    pub fn window_key(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start, self.end)
    }

    /// Start is inclusive, end exclusive.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    pub fn target_for(
        &self,
        home: &str,
        zone: &str,
        device: &str,
        reading_type: &str,
    ) -> Option<&DeviceTarget> {
        self.targets
            .iter()
            .rev()
            .find(|target| target.matches(home, zone, device, reading_type))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverrideConfig {
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub changes: Vec<DeviceTargetConfig>,
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

/// A zone's schedules and overrides, kept sorted, with target resolution.
#[derive(Debug, Default)]
pub struct ZoneProgram {
    schedules: Vec<Schedule>,
    overrides: Vec<Override>,
}

impl ZoneProgram {
    /// Full replacement; the incoming order breaks ties between equal start
    /// times (stable sort).
    pub fn set_schedules(&mut self, mut schedules: Vec<Schedule>) {
        schedules.sort_by_key(Schedule::start_key);
        self.schedules = schedules;
    }

    pub fn set_overrides(&mut self, mut overrides: Vec<Override>) {
        overrides.sort_by_key(Override::window_key);
        self.overrides = overrides;
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    /// Active target for (device, type): the last matching active override
    /// wins outright; otherwise the last schedule already begun today.
    pub fn resolve(
        &self,
        now: DateTime<Utc>,
        tz: Tz,
        home: &str,
        zone: &str,
        device: &str,
        reading_type: &str,
    ) -> Option<&DeviceTarget> {
        let mut found = None;
        for entry in &self.overrides {
            if entry.contains(now) {
                if let Some(target) = entry.target_for(home, zone, device, reading_type) {
                    found = Some(target);
                }
            }
        }
        if found.is_some() {
            return found;
        }

        let local = now.with_timezone(&tz);
        let weekday = local.weekday().num_days_from_sunday() as u8;
        let hour = local.hour() as u8;
        let minute = local.minute() as u8;

        for entry in &self.schedules {
            if entry.is_active_at(weekday, hour, minute) {
                if let Some(target) = entry.target_for(home, zone, device, reading_type) {
                    found = Some(target);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn target_config(device: &str, reading_type: &str, value: f64) -> DeviceTargetConfig {
        DeviceTargetConfig {
            home: None,
            zone: None,
            device: device.to_string(),
            reading_type: reading_type.to_string(),
            value: Quantity {
                value: Value::Float(value),
                unit: "celsius".to_string(),
            },
        }
    }

    fn schedule(days: &[i64], start: &str, device: &str, value: f64) -> Schedule {
        Schedule::from_config(
            ScheduleConfig {
                days: days.to_vec(),
                start: Some(start.to_string()),
                changes: vec![target_config(device, "temperature", value)],
            },
            "h1",
            "z1",
        )
        .unwrap()
    }

    fn override_window(start: &str, end: &str, device: &str, value: f64) -> Override {
        Override::from_config(
            OverrideConfig {
                start: Some(start.to_string()),
                end: Some(end.to_string()),
                changes: vec![target_config(device, "temperature", value)],
            },
            "h1",
            "z1",
        )
        .unwrap()
    }

    fn resolve_t1(program: &ZoneProgram, now: DateTime<Utc>) -> Option<f64> {
        program
            .resolve(now, chrono_tz::UTC, "h1", "z1", "t1", "temperature")
            .and_then(|target| target.value.value.as_f64())
    }

    #[test]
    fn later_schedule_of_the_day_wins() {
        let mut program = ZoneProgram::default();
        program.set_schedules(vec![
            schedule(&[0, 1, 2, 3, 4, 5, 6], "06:00", "t1", 21.0),
            schedule(&[0, 1, 2, 3, 4, 5, 6], "22:00", "t1", 17.0),
        ]);

        // Jan 5 2026 is a Monday.
        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 12, 0, 0)), Some(21.0));
        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 23, 0, 0)), Some(17.0));
        // Before the first start of the day nothing applies.
        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 5, 59, 0)), None);
    }

    #[test]
    fn schedule_start_minute_is_inclusive() {
        let mut program = ZoneProgram::default();
        program.set_schedules(vec![schedule(&[1], "08:30", "t1", 20.0)]);

        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 8, 30, 0)), Some(20.0));
        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 8, 29, 59)), None);
    }

    #[test]
    fn day_bitmask_counts_sunday_as_zero() {
        let mut program = ZoneProgram::default();
        program.set_schedules(vec![schedule(&[0], "00:00", "t1", 19.0)]);

        // Jan 4 2026 is a Sunday, Jan 5 a Monday.
        assert_eq!(resolve_t1(&program, utc(2026, 1, 4, 12, 0, 0)), Some(19.0));
        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 12, 0, 0)), None);
    }

    #[test]
    fn schedule_matching_uses_the_configured_timezone() {
        let mut program = ZoneProgram::default();
        program.set_schedules(vec![schedule(&[1], "08:00", "t1", 20.0)]);
        let tz: Tz = "America/New_York".parse().unwrap();

        // 12:30 UTC on Jan 5 is 07:30 in New York: not yet active.
        let early = program.resolve(utc(2026, 1, 5, 12, 30, 0), tz, "h1", "z1", "t1", "temperature");
        assert!(early.is_none());

        // 13:30 UTC is 08:30 local.
        let late = program.resolve(utc(2026, 1, 5, 13, 30, 0), tz, "h1", "z1", "t1", "temperature");
        assert!(late.is_some());
    }

    #[test]
    fn overrides_beat_schedules() {
        let mut program = ZoneProgram::default();
        program.set_schedules(vec![schedule(&[0, 1, 2, 3, 4, 5, 6], "00:00", "t1", 21.0)]);
        program.set_overrides(vec![override_window(
            "2026-01-05T10:00:00Z",
            "2026-01-05T12:00:00Z",
            "t1",
            18.0,
        )]);

        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 11, 0, 0)), Some(18.0));
        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 13, 0, 0)), Some(21.0));
    }

    #[test]
    fn override_window_is_start_inclusive_end_exclusive() {
        let entry = override_window("2026-01-05T10:00:00Z", "2026-01-05T12:00:00Z", "t1", 18.0);

        assert!(entry.contains(utc(2026, 1, 5, 10, 0, 0)));
        assert!(entry.contains(utc(2026, 1, 5, 11, 59, 59)));
        assert!(!entry.contains(utc(2026, 1, 5, 12, 0, 0)));
        assert!(!entry.contains(utc(2026, 1, 5, 9, 59, 59)));
    }

    #[test]
    fn last_matching_override_wins() {
        let mut program = ZoneProgram::default();
        program.set_overrides(vec![
            override_window("2026-01-05T08:00:00Z", "2026-01-05T20:00:00Z", "t1", 16.0),
            override_window("2026-01-05T10:00:00Z", "2026-01-05T12:00:00Z", "t1", 18.0),
        ]);

        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 11, 0, 0)), Some(18.0));
        assert_eq!(resolve_t1(&program, utc(2026, 1, 5, 15, 0, 0)), Some(16.0));
    }

    #[test]
    fn lists_stay_sorted_after_replacement() {
        let mut program = ZoneProgram::default();
        program.set_schedules(vec![
            schedule(&[1], "18:00", "t1", 17.0),
            schedule(&[1], "06:30", "t1", 21.0),
            schedule(&[1], "06:00", "t1", 20.0),
        ]);
        let keys: Vec<_> = program.schedules().iter().map(Schedule::start_key).collect();
        assert_eq!(keys, vec![(6, 0), (6, 30), (18, 0)]);

        program.set_overrides(vec![
            override_window("2026-01-06T00:00:00Z", "2026-01-07T00:00:00Z", "t1", 15.0),
            override_window("2026-01-05T00:00:00Z", "2026-01-06T00:00:00Z", "t1", 16.0),
        ]);
        let starts: Vec<_> = program.overrides().iter().map(|entry| entry.start).collect();
        assert!(starts.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn empty_type_target_acts_as_wildcard() {
        let mut program = ZoneProgram::default();
        let config = ScheduleConfig {
            days: vec![0, 1, 2, 3, 4, 5, 6],
            start: Some("00:00".to_string()),
            changes: vec![DeviceTargetConfig {
                home: None,
                zone: None,
                device: "sw1".to_string(),
                reading_type: String::new(),
                value: Quantity {
                    value: Value::Bool(true),
                    unit: String::new(),
                },
            }],
        };
        program.set_schedules(vec![Schedule::from_config(config, "h1", "z1").unwrap()]);

        let target =
            program.resolve(utc(2026, 1, 5, 9, 0, 0), chrono_tz::UTC, "h1", "z1", "sw1", "switch");
        assert_eq!(target.unwrap().value.value, Value::Bool(true));
    }

    #[test]
    fn targets_for_other_homes_do_not_leak() {
        let mut program = ZoneProgram::default();
        let config = ScheduleConfig {
            days: vec![0, 1, 2, 3, 4, 5, 6],
            start: Some("00:00".to_string()),
            changes: vec![DeviceTargetConfig {
                home: Some("h2".to_string()),
                zone: None,
                device: "t1".to_string(),
                reading_type: "temperature".to_string(),
                value: Quantity::default(),
            }],
        };
        program.set_schedules(vec![Schedule::from_config(config, "h1", "z1").unwrap()]);

        assert!(resolve_t1(&program, utc(2026, 1, 5, 9, 0, 0)).is_none());
    }

    #[test]
    fn malformed_start_is_rejected_but_missing_start_means_midnight() {
        let bad = ScheduleConfig {
            days: vec![1],
            start: Some("25:99".to_string()),
            changes: Vec::new(),
        };
        assert!(Schedule::from_config(bad, "h1", "z1").is_none());

        let missing = ScheduleConfig {
            days: vec![1],
            start: None,
            changes: Vec::new(),
        };
        let schedule = Schedule::from_config(missing, "h1", "z1").unwrap();
        assert_eq!(schedule.start_key(), (0, 0));
    }

    #[test]
    fn override_without_end_collapses_to_start() {
        let config = OverrideConfig {
            start: Some("2026-01-05T10:00:00Z".to_string()),
            end: None,
            changes: Vec::new(),
        };
        let entry = Override::from_config(config, "h1", "z1").unwrap();
        assert!(!entry.contains(utc(2026, 1, 5, 10, 0, 0)));
    }
}
