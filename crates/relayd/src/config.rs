//! TOML config file loading, validation, and database seeding for relay
//! devices and their light schedules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::{now_unix, Db};
use crate::schedule::{parse_day, parse_hhmm, Days, Schedule};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    /// piTest variable name, e.g. "RelayLight".
    pub device_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEntry {
    pub device_id: String,
    pub on: String,
    pub off: String,
    pub days: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl ScheduleEntry {
    /// Convert a validated entry into a schedule row.
    pub fn to_schedule(&self, updated_at: i64) -> Result<Schedule> {
        let days: Days = self
            .days
            .iter()
            .map(|d| parse_day(d))
            .collect::<Result<_, _>>()?;
        Ok(Schedule {
            device_id: self.device_id.clone(),
            on_time: parse_hhmm(&self.on)?,
            off_time: parse_hhmm(&self.off)?,
            days,
            enabled: self.enabled,
            updated_at,
        })
    }
}

/// Device ids go straight onto the piTest command line as `<id>,<value>`.
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_devices(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.device_id.clone()).collect()
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !is_valid_device_id(&d.device_id) {
                errors.push(format!(
                    "{}: device_id may only contain letters, digits and '_'",
                    ctx()
                ));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let device_ids: HashSet<&str> = self.devices.iter().map(|d| d.device_id.as_str()).collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || {
                if s.device_id.is_empty() {
                    format!("schedules[{i}]")
                } else {
                    format!("schedule '{}'", s.device_id)
                }
            };

            // ── Device reference ────────────────────────────────
            if s.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !device_ids.contains(s.device_id.as_str()) {
                errors.push(format!(
                    "{}: device_id '{}' does not match any defined device",
                    ctx(),
                    s.device_id
                ));
            } else if !seen.insert(&s.device_id) {
                errors.push(format!("{}: more than one schedule for this device", ctx()));
            }

            // ── Times ───────────────────────────────────────────
            if let Err(e) = parse_hhmm(&s.on) {
                errors.push(format!("{}: on: {e}", ctx()));
            }
            if let Err(e) = parse_hhmm(&s.off) {
                errors.push(format!("{}: off: {e}", ctx()));
            }

            // ── Days ────────────────────────────────────────────
            if s.days.is_empty() {
                errors.push(format!("{}: at least one day must be selected", ctx()));
            }
            let mut seen_days: HashSet<String> = HashSet::new();
            for d in &s.days {
                if let Err(e) = parse_day(d) {
                    errors.push(format!("{}: {e}", ctx()));
                } else if !seen_days.insert(d.trim().to_ascii_lowercase()) {
                    errors.push(format!("{}: day '{}' listed twice", ctx(), d.trim()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed schedules from the config into the database.  Each device is seeded
/// once; edits and deletions made from the command line survive restarts.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let now = now_unix();
    let mut seeded = 0;

    for entry in &config.schedules {
        let schedule = entry
            .to_schedule(now)
            .with_context(|| format!("schedule '{}'", entry.device_id))?;
        if schedule.is_degenerate() {
            tracing::warn!(
                device = %schedule.device_id,
                "on and off times are equal; this schedule never switches on"
            );
        }
        let inserted = db
            .seed_schedule(&schedule)
            .await
            .with_context(|| format!("failed to seed schedule '{}'", entry.device_id))?;
        if inserted {
            seeded += 1;
        }
    }

    for stored in db.load_schedules().await? {
        if config.device(&stored.device_id).is_none() {
            tracing::warn!(
                device = %stored.device_id,
                "stored schedule belongs to a device missing from the config; it is not enforced"
            );
        }
    }

    tracing::info!(
        devices = config.devices.len(),
        schedules = config.schedules.len(),
        seeded,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::format_hhmm;
    use std::io::Write;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_device() -> DeviceEntry {
        DeviceEntry {
            device_id: "RelayLight".into(),
            name: "Site light".into(),
        }
    }

    fn valid_schedule() -> ScheduleEntry {
        ScheduleEntry {
            device_id: "RelayLight".into(),
            on: "18:00".into(),
            off: "06:00".into(),
            days: vec!["mon".into(), "fri".into()],
            enabled: true,
        }
    }

    fn valid_config() -> Config {
        Config {
            devices: vec![valid_device()],
            schedules: vec![valid_schedule()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[[devices]]
device_id = "RelayLight"
name = "Site light"

[[devices]]
device_id = "RelayScreen"
name = "Screen"

[[schedules]]
device_id = "RelayLight"
on = "18:00"
off = "06:00"
days = ["mon", "tue"]
enabled = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].off, "06:00");
        assert!(config.schedules[0].enabled);
        config.validate().unwrap();
    }

    #[test]
    fn enabled_defaults_to_false() {
        let toml_str = r#"
[[schedules]]
device_id = "RelayLight"
on = "08:00"
off = "17:00"
days = ["mon"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(!config.schedules[0].enabled);
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.devices.is_empty());
        assert!(config.schedules.is_empty());
        config.validate().unwrap();
    }

    // -- Devices ----------------------------------------------------------

    #[test]
    fn device_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].device_id = "".into();
        assert_validation_err(&cfg, "device_id is empty");
    }

    #[test]
    fn device_id_with_comma_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].device_id = "Relay,1".into();
        assert_validation_err(&cfg, "may only contain");
    }

    #[test]
    fn device_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices.push(valid_device());
        assert_validation_err(&cfg, "duplicate device_id");
    }

    #[test]
    fn device_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    // -- Schedules --------------------------------------------------------

    #[test]
    fn schedule_unknown_device_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].device_id = "RelayGhost".into();
        assert_validation_err(&cfg, "does not match any defined device");
    }

    #[test]
    fn schedule_duplicate_for_device_rejected() {
        let mut cfg = valid_config();
        cfg.schedules.push(valid_schedule());
        assert_validation_err(&cfg, "more than one schedule");
    }

    #[test]
    fn schedule_bad_time_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].on = "25:00".into();
        assert_validation_err(&cfg, "on: invalid time '25:00'");
    }

    #[test]
    fn schedule_overnight_accepted() {
        let cfg = valid_config();
        assert!(cfg.schedules[0].on > cfg.schedules[0].off);
        cfg.validate().unwrap();
    }

    #[test]
    fn schedule_equal_times_accepted() {
        let mut cfg = valid_config();
        cfg.schedules[0].off = "18:00".into();
        cfg.validate().unwrap();
    }

    #[test]
    fn schedule_no_days_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].days.clear();
        assert_validation_err(&cfg, "at least one day");
    }

    #[test]
    fn schedule_bad_day_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].days.push("someday".into());
        assert_validation_err(&cfg, "unknown weekday 'someday'");
    }

    #[test]
    fn schedule_repeated_day_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].days.push("MON".into());
        assert_validation_err(&cfg, "listed twice");
    }

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            devices: vec![DeviceEntry {
                device_id: "".into(),
                name: "".into(),
            }],
            schedules: vec![ScheduleEntry {
                device_id: "Nope".into(),
                on: "x".into(),
                off: "y".into(),
                days: vec![],
                enabled: true,
            }],
        };
        let err = format!("{:#}", cfg.validate().unwrap_err());
        assert!(err.contains("6 errors"), "got: {err}");
    }

    #[test]
    fn entry_converts_to_schedule() {
        let s = valid_schedule().to_schedule(42).unwrap();
        assert_eq!(format_hhmm(s.on_time), "18:00");
        assert_eq!(format_hhmm(s.off_time), "06:00");
        assert_eq!(s.days.to_string(), "mon,fri");
        assert_eq!(s.updated_at, 42);
    }

    // -- Load + apply -----------------------------------------------------

    #[test]
    fn load_reads_and_validates_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
[[devices]]
device_id = "RelayLight"
name = "Site light"

[[schedules]]
device_id = "RelayScreen"
on = "18:00"
off = "06:00"
days = ["mon"]
"#
        )
        .unwrap();

        let err = load(f.path().to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config"));
    }

    #[test]
    fn load_missing_file_errors() {
        let err = load("/nonexistent/relayd.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }

    #[tokio::test]
    async fn apply_seeds_without_overwriting() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config = valid_config();
        config.validate().unwrap();
        apply(&config, &db).await.unwrap();

        let got = db.get_schedule("RelayLight").await.unwrap().unwrap();
        assert_eq!(format_hhmm(got.on_time), "18:00");
        assert!(got.enabled);

        // An operator edit must survive the next startup.
        db.set_schedule_enabled("RelayLight", false).await.unwrap();
        apply(&config, &db).await.unwrap();
        let got = db.get_schedule("RelayLight").await.unwrap().unwrap();
        assert!(!got.enabled);
    }

    #[tokio::test]
    async fn deleted_schedule_stays_deleted_after_apply() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config = valid_config();
        apply(&config, &db).await.unwrap();
        assert!(db.delete_schedule("RelayLight").await.unwrap());

        // Every command re-applies the config on startup.
        apply(&config, &db).await.unwrap();
        assert!(db.get_schedule("RelayLight").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_tolerates_schedules_of_undeclared_devices() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let mut orphan = valid_schedule().to_schedule(0).unwrap();
        orphan.device_id = "RelayRemoved".into();
        db.upsert_schedule(&orphan).await.unwrap();

        apply(&valid_config(), &db).await.unwrap();
        assert_eq!(db.load_schedules().await.unwrap().len(), 2);
    }
}
