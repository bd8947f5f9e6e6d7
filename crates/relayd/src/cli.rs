//! Command-line surface.  Process settings can also come from the
//! environment so the same binary runs unchanged under systemd.

use clap::builder::BoolishValueParser;
use clap::{Parser, Subcommand, ValueEnum};
use time::{Time, UtcOffset};

use crate::clock::parse_offset;
use crate::relay::Switch;
use crate::schedule::{parse_hhmm, Days};

/// Schedule-driven relay controller for Revolution Pi boards.
#[derive(Parser, Debug)]
#[command(name = "revpi-relayd", version, about)]
pub struct Cli {
    /// Path to the TOML device/schedule file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.toml", global = true)]
    pub config: String,

    /// SQLite connection string.
    #[arg(long, env = "DB_URL", default_value = "sqlite:relayd.db?mode=rwc", global = true)]
    pub db_url: String,

    /// Seconds between scheduler ticks.
    #[arg(
        long,
        env = "TICK_SEC",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    pub tick_sec: u64,

    /// Upper bound in seconds for a single relay read or command.
    #[arg(
        long,
        env = "RELAY_TIMEOUT_SEC",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    pub relay_timeout_sec: u64,

    /// Relay inputs are active-low (piTest value 0 = ON).
    #[arg(
        long,
        env = "RELAY_ACTIVE_LOW",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub active_low: bool,

    /// piTest executable.
    #[arg(long, env = "PITEST_BIN", default_value = "piTest", global = true)]
    pub pitest_bin: String,

    /// Fixed local UTC offset, e.g. +02:00.  Detected from the system when unset.
    #[arg(long, env = "UTC_OFFSET", value_parser = parse_offset, global = true)]
    pub utc_offset: Option<UtcOffset>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the scheduler until interrupted (default).
    Run,
    /// Reconcile every scheduled device once and exit.
    Tick,
    /// Print the current state of every configured relay.
    Status,
    /// Switch a relay by hand.
    Set {
        device: String,
        #[arg(value_parser = parse_switch)]
        state: Switch,
        /// Name recorded in the activation log.
        #[arg(long, env = "USER", default_value = "operator")]
        user: String,
    },
    /// Inspect or edit stored schedules.
    Schedule {
        #[command(subcommand)]
        action: ScheduleCommand,
    },
    /// Show recent relay activations.
    History {
        #[arg(long)]
        device: Option<String>,
        #[arg(long, value_enum, default_value_t = HistoryRange::Day)]
        range: HistoryRange,
        #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(i64).range(1..))]
        limit: i64,
        /// Per-device on/off counts instead of individual records.
        #[arg(long)]
        summary: bool,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ScheduleCommand {
    /// Print one schedule, or all of them.
    Show { device: Option<String> },
    /// Create or replace a device's schedule.
    Set {
        device: String,
        #[arg(long, value_parser = parse_hhmm)]
        on: Time,
        #[arg(long, value_parser = parse_hhmm)]
        off: Time,
        /// Comma-separated weekdays, e.g. mon,tue,fri.
        #[arg(long, value_parser = parse_days)]
        days: Days,
        /// Enforce the schedule.  Without this flag an existing schedule keeps
        /// its current enabled setting and a new one starts disabled.
        #[arg(long)]
        enable: bool,
    },
    Enable { device: String },
    Disable { device: String },
    Delete { device: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRange {
    #[value(name = "1h")]
    Hour,
    #[value(name = "24h")]
    Day,
    #[value(name = "7d")]
    Week,
    #[value(name = "30d")]
    Month,
}

impl HistoryRange {
    pub fn seconds(self) -> i64 {
        match self {
            HistoryRange::Hour => 3_600,
            HistoryRange::Day => 86_400,
            HistoryRange::Week => 7 * 86_400,
            HistoryRange::Month => 30 * 86_400,
        }
    }
}

fn parse_switch(s: &str) -> Result<Switch, String> {
    Switch::parse(s).ok_or_else(|| format!("expected 'on' or 'off', got '{s}'"))
}

fn parse_days(s: &str) -> Result<Days, String> {
    let days: Days = s.parse().map_err(|e| format!("{e}"))?;
    if days.is_empty() {
        return Err("at least one day must be selected".into());
    }
    let listed = s.split(',').filter(|p| !p.trim().is_empty()).count();
    if listed != days.names().len() {
        return Err(format!("a day is listed twice in '{s}'"));
    }
    Ok(days)
}

// ===========================================================================
// Tests
// ===========================================================================
