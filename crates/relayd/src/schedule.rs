//! Light schedules and the pure evaluator that decides whether a relay should
//! be ON right now.
//!
//! A schedule is an ON/OFF time pair plus the weekdays on which the ON
//! transition may begin.  When `off_time <= on_time` the window runs overnight:
//! ON today at `on_time`, OFF tomorrow at `off_time`.  The day that *starts* the
//! window decides whether it runs, so Friday 18:00–06:00 keeps the light on
//! until Saturday 06:00 even when Saturday itself is not an active day.
//!
//! ```text
//! same-day   on < off     ──────[on ███████ off)──────────────
//! overnight  on > off     ██ off)───────────────[on █████████
//!                         ^ driven by yesterday  ^ driven by today
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;
use time::{Time, Weekday};

use crate::relay::Switch;

/// Weekday abbreviations in Monday-first order, as stored in the database.
const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid time '{0}' (use HH:MM, 00:00-23:59)")]
    BadTime(String),
    #[error("unknown weekday '{0}' (use mon, tue, wed, thu, fri, sat, sun)")]
    BadDay(String),
}

// ---------------------------------------------------------------------------
// Time of day
// ---------------------------------------------------------------------------

/// Parse a 24-hour `HH:MM` string.  Seconds are not accepted.
pub fn parse_hhmm(s: &str) -> Result<Time, ScheduleError> {
    let bad = || ScheduleError::BadTime(s.to_string());
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if h.is_empty() || h.len() > 2 || m.len() != 2 || !digits(h) || !digits(m) {
        return Err(bad());
    }
    let hour: u8 = h.parse().map_err(|_| bad())?;
    let minute: u8 = m.parse().map_err(|_| bad())?;
    Time::from_hms(hour, minute, 0).map_err(|_| bad())
}

pub fn format_hhmm(t: Time) -> String {
    format!("{:02}:{:02}", t.hour(), t.minute())
}

fn serialize_hhmm<S: Serializer>(t: &Time, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_hhmm(*t))
}

// ---------------------------------------------------------------------------
// Active days
// ---------------------------------------------------------------------------

/// Set of weekdays, one bit per day (bit 0 = Monday).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Days(u8);

impl Days {
    pub const NONE: Days = Days(0);

    pub fn with(self, day: Weekday) -> Days {
        Days(self.0 | (1 << day.number_days_from_monday()))
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.number_days_from_monday()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        DAY_NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl FromIterator<Weekday> for Days {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        iter.into_iter().fold(Days::NONE, Days::with)
    }
}

/// Parse a single abbreviation (`mon`, `Tue`, ...).
pub fn parse_day(s: &str) -> Result<Weekday, ScheduleError> {
    let day = match s.trim().to_ascii_lowercase().as_str() {
        "mon" => Weekday::Monday,
        "tue" => Weekday::Tuesday,
        "wed" => Weekday::Wednesday,
        "thu" => Weekday::Thursday,
        "fri" => Weekday::Friday,
        "sat" => Weekday::Saturday,
        "sun" => Weekday::Sunday,
        _ => return Err(ScheduleError::BadDay(s.trim().to_string())),
    };
    Ok(day)
}

/// Comma-separated form used in the database and on the command line.
impl FromStr for Days {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(parse_day)
            .collect()
    }
}

impl fmt::Display for Days {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

impl Serialize for Days {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(s)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub device_id: String,
    #[serde(serialize_with = "serialize_hhmm")]
    pub on_time: Time,
    #[serde(serialize_with = "serialize_hhmm")]
    pub off_time: Time,
    pub days: Days,
    pub enabled: bool,
    /// Unix seconds of the last edit.  Informational only.
    pub updated_at: i64,
}

impl Schedule {
    pub fn is_overnight(&self) -> bool {
        self.off_time < self.on_time
    }

    /// `on_time == off_time` never switches the relay on.
    pub fn is_degenerate(&self) -> bool {
        self.on_time == self.off_time
    }
}

/// Desired relay position for `schedule` at local `weekday`/`at`.
///
/// ON is inclusive of `on_time`, OFF happens exactly at `off_time`.  A
/// disabled or degenerate schedule is always OFF.
pub fn desired_state(weekday: Weekday, at: Time, schedule: &Schedule) -> Switch {
    if !schedule.enabled || schedule.is_degenerate() {
        return Switch::Off;
    }

    let on = schedule.on_time;
    let off = schedule.off_time;
    let days = schedule.days;

    let lit = if on < off {
        days.contains(weekday) && on <= at && at < off
    } else {
        let started_today = days.contains(weekday) && at >= on;
        let started_yesterday = days.contains(weekday.previous()) && at < off;
        started_today || started_yesterday
    };

    Switch::from(lit)
}

// ===========================================================================
// Tests
// ===========================================================================
