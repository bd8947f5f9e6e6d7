//! Relay control.  The `pitest` feature drives the RevPi process image through
//! the vendor `piTest` utility; without it, a mock board keeps relay state in
//! memory and logs changes.

use std::fmt;
use std::future::Future;

use serde::Serialize;
use thiserror::Error;

#[cfg(not(feature = "pitest"))]
use std::collections::HashMap;
#[cfg(not(feature = "pitest"))]
use std::sync::Mutex;

#[cfg(feature = "pitest")]
use std::collections::HashSet;
#[cfg(feature = "pitest")]
use tokio::process::Command;
#[cfg(feature = "pitest")]
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Relay positions
// ---------------------------------------------------------------------------

/// A commanded relay position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn as_str(self) -> &'static str {
        match self {
            Switch::On => "on",
            Switch::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<Switch> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Some(Switch::On),
            "off" => Some(Switch::Off),
            _ => None,
        }
    }
}

impl From<bool> for Switch {
    fn from(on: bool) -> Self {
        if on {
            Switch::On
        } else {
            Switch::Off
        }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observed relay position as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    On,
    Off,
    Unknown,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayState::On => "ON",
            RelayState::Off => "OFF",
            RelayState::Unknown => "UNKNOWN",
        }
    }

    /// `Unknown` never matches, so an unreadable relay always gets corrected.
    pub fn matches(self, desired: Switch) -> bool {
        matches!(
            (self, desired),
            (RelayState::On, Switch::On) | (RelayState::Off, Switch::Off)
        )
    }
}

impl From<Switch> for RelayState {
    fn from(s: Switch) -> Self {
        match s {
            Switch::On => RelayState::On,
            Switch::Off => RelayState::Off,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("failed to start relay utility: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("relay utility exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
}

// ---------------------------------------------------------------------------
// Hardware seam
// ---------------------------------------------------------------------------

/// Reads and commands relays by device id.  Implementations must not cache
/// state between calls: every `read_state` reflects the hardware right now.
pub trait RelayControl: Send + Sync {
    fn read_state(&self, device_id: &str)
        -> impl Future<Output = Result<RelayState, RelayError>> + Send;

    fn set_state(&self, device_id: &str, to: Switch)
        -> impl Future<Output = Result<(), RelayError>> + Send;
}

#[derive(Debug, Clone)]
pub struct BoardOptions {
    /// Path or name of the `piTest` binary.
    pub pitest_bin: String,
    /// Many RevPi relay outputs are wired active-low: value 0 = ON.
    pub active_low: bool,
}

impl Default for BoardOptions {
    fn default() -> Self {
        Self {
            pitest_bin: "piTest".to_string(),
            active_low: true,
        }
    }
}

/// Process-image value that puts a relay in position `to`.
pub fn level_for(to: Switch, active_low: bool) -> u8 {
    if (to == Switch::On) != active_low {
        1
    } else {
        0
    }
}

/// Interpret a process-image value.  Anything other than 0/1 is `Unknown`.
pub fn state_from_level(level: u8, active_low: bool) -> RelayState {
    match level {
        0 | 1 => RelayState::from(Switch::from((level == 1) != active_low)),
        _ => RelayState::Unknown,
    }
}

/// Pull the value out of `piTest -1 -r` output.  The first line either holds a
/// bare integer or ends with `...: <value>`.
pub fn parse_pitest_value(output: &str) -> Option<u8> {
    let first = output.lines().next()?.trim();
    let value = match first.rsplit_once(':') {
        Some((_, v)) => v,
        None => first,
    };
    value.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// piTest relay board (production — requires a RevPi with piControl)
// ---------------------------------------------------------------------------
#[cfg(feature = "pitest")]
pub(crate) struct RelayBoard {
    devices: HashSet<String>,
    opts: BoardOptions,
}

#[cfg(feature = "pitest")]
impl RelayBoard {
    pub(crate) fn new(device_ids: &[String], opts: BoardOptions) -> anyhow::Result<Self> {
        for id in device_ids {
            info!(device = %id, bin = %opts.pitest_bin, active_low = opts.active_low, "relay registered");
        }
        Ok(Self {
            devices: device_ids.iter().cloned().collect(),
            opts,
        })
    }

    fn check(&self, device_id: &str) -> Result<(), RelayError> {
        if self.devices.contains(device_id) {
            Ok(())
        } else {
            Err(RelayError::UnknownDevice(device_id.to_string()))
        }
    }

    async fn pitest(&self, args: &[&str]) -> Result<String, RelayError> {
        let out = Command::new(&self.opts.pitest_bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        if !out.status.success() {
            return Err(RelayError::Exit {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[cfg(feature = "pitest")]
impl RelayControl for RelayBoard {
    async fn read_state(&self, device_id: &str) -> Result<RelayState, RelayError> {
        self.check(device_id)?;
        let stdout = self.pitest(&["-1", "-r", device_id]).await?;
        let state = match parse_pitest_value(&stdout) {
            Some(level) => state_from_level(level, self.opts.active_low),
            None => RelayState::Unknown,
        };
        debug!(device = %device_id, output = %stdout.trim(), ?state, "piTest read");
        Ok(state)
    }

    async fn set_state(&self, device_id: &str, to: Switch) -> Result<(), RelayError> {
        self.check(device_id)?;
        let arg = format!("{device_id},{}", level_for(to, self.opts.active_low));
        self.pitest(&["-w", arg.as_str()]).await?;
        info!(device = %device_id, state = %to, "relay switched");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development — no hardware, state kept in memory)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "pitest"))]
pub(crate) struct RelayBoard {
    pub(super) relays: Mutex<HashMap<String, Switch>>, // device_id -> position
}

#[cfg(not(feature = "pitest"))]
impl RelayBoard {
    pub(crate) fn new(device_ids: &[String], _opts: BoardOptions) -> anyhow::Result<Self> {
        let mut relays = HashMap::new();
        for id in device_ids {
            tracing::info!(device = %id, "[mock-relay] registered (not wired)");
            relays.insert(id.clone(), Switch::Off);
        }
        tracing::info!("[mock-relay] relay board initialised (no hardware)");
        Ok(Self {
            relays: Mutex::new(relays),
        })
    }
}

#[cfg(not(feature = "pitest"))]
impl RelayControl for RelayBoard {
    async fn read_state(&self, device_id: &str) -> Result<RelayState, RelayError> {
        let relays = self
            .relays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        relays
            .get(device_id)
            .map(|s| RelayState::from(*s))
            .ok_or_else(|| RelayError::UnknownDevice(device_id.to_string()))
    }

    async fn set_state(&self, device_id: &str, to: Switch) -> Result<(), RelayError> {
        let mut relays = self
            .relays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match relays.get_mut(device_id) {
            Some(state) => {
                *state = to;
                tracing::info!(device = %device_id, state = %to, "[mock-relay] relay set");
                Ok(())
            }
            None => Err(RelayError::UnknownDevice(device_id.to_string())),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Switch / RelayState ------------------------------------------------

    #[test]
    fn switch_parse_is_case_insensitive() {
        assert_eq!(Switch::parse("ON"), Some(Switch::On));
        assert_eq!(Switch::parse(" off "), Some(Switch::Off));
        assert_eq!(Switch::parse("toggle"), None);
    }

    #[test]
    fn unknown_state_matches_nothing() {
        assert!(!RelayState::Unknown.matches(Switch::On));
        assert!(!RelayState::Unknown.matches(Switch::Off));
        assert!(RelayState::On.matches(Switch::On));
        assert!(!RelayState::Off.matches(Switch::On));
    }

    #[test]
    fn relay_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&RelayState::Unknown).unwrap(), r#""UNKNOWN""#);
        assert_eq!(serde_json::to_string(&Switch::On).unwrap(), r#""on""#);
        for state in [RelayState::On, RelayState::Off, RelayState::Unknown] {
            assert_eq!(
                serde_json::to_string(&state).unwrap(),
                format!("\"{}\"", state.as_str())
            );
        }
    }

    // -- Level mapping ------------------------------------------------------

    #[test]
    fn active_low_levels() {
        assert_eq!(level_for(Switch::On, true), 0);
        assert_eq!(level_for(Switch::Off, true), 1);
        assert_eq!(state_from_level(0, true), RelayState::On);
        assert_eq!(state_from_level(1, true), RelayState::Off);
    }

    #[test]
    fn active_high_levels() {
        assert_eq!(level_for(Switch::On, false), 1);
        assert_eq!(level_for(Switch::Off, false), 0);
        assert_eq!(state_from_level(1, false), RelayState::On);
        assert_eq!(state_from_level(0, false), RelayState::Off);
    }

    #[test]
    fn out_of_range_level_is_unknown() {
        assert_eq!(state_from_level(7, true), RelayState::Unknown);
    }

    // -- piTest output ------------------------------------------------------

    #[test]
    fn parse_pitest_labelled_line() {
        assert_eq!(parse_pitest_value("1 Byte-Value of RelayLight: 0\n"), Some(0));
        assert_eq!(parse_pitest_value("Bit value: 1\nextra\n"), Some(1));
    }

    #[test]
    fn parse_pitest_bare_value() {
        assert_eq!(parse_pitest_value("1\n"), Some(1));
    }

    #[test]
    fn parse_pitest_garbage() {
        assert_eq!(parse_pitest_value(""), None);
        assert_eq!(parse_pitest_value("Cannot find variable 'Foo'"), None);
        assert_eq!(parse_pitest_value("value: abc"), None);
    }

    // -- RelayBoard (mock) --------------------------------------------------

    #[cfg(not(feature = "pitest"))]
    fn board(ids: &[&str]) -> RelayBoard {
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        RelayBoard::new(&ids, BoardOptions::default()).unwrap()
    }

    #[cfg(not(feature = "pitest"))]
    #[tokio::test]
    async fn mock_board_registers_devices_off() {
        let b = board(&["RelayLight", "RelayScreen"]);
        assert_eq!(b.relays.lock().unwrap().len(), 2);
        assert_eq!(b.read_state("RelayLight").await.unwrap(), RelayState::Off);
    }

    #[cfg(not(feature = "pitest"))]
    #[tokio::test]
    async fn mock_board_set_then_read() {
        let b = board(&["RelayLight"]);
        b.set_state("RelayLight", Switch::On).await.unwrap();
        assert_eq!(b.read_state("RelayLight").await.unwrap(), RelayState::On);
        b.set_state("RelayLight", Switch::Off).await.unwrap();
        assert_eq!(b.read_state("RelayLight").await.unwrap(), RelayState::Off);
    }

    #[cfg(not(feature = "pitest"))]
    #[tokio::test]
    async fn mock_board_unknown_device_errors() {
        let b = board(&["RelayLight"]);
        assert!(matches!(
            b.read_state("Nope").await,
            Err(RelayError::UnknownDevice(id)) if id == "Nope"
        ));
        assert!(b.set_state("Nope", Switch::On).await.is_err());
        assert_eq!(b.relays.lock().unwrap().len(), 1); // no new entry created
    }
}
