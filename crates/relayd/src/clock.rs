//! Local wall-clock time for schedule evaluation.
//!
//! The offset is fixed for the life of the process.  It is either configured
//! explicitly or detected once at startup, before any worker threads exist
//! (the `time` crate refuses to read the local offset from a multi-threaded
//! process on Unix).

use anyhow::{Context, Result};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalClock {
    offset: UtcOffset,
}

impl LocalClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Use the system's current local offset, or UTC if it cannot be
    /// determined.  Call before starting the async runtime.
    pub fn detect() -> Self {
        match UtcOffset::current_local_offset() {
            Ok(offset) => Self::new(offset),
            Err(e) => {
                warn!("could not determine local UTC offset ({e}); using UTC");
                Self::new(UtcOffset::UTC)
            }
        }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    pub fn now(&self) -> PrimitiveDateTime {
        self.localize(OffsetDateTime::now_utc())
    }

    pub fn localize(&self, at: OffsetDateTime) -> PrimitiveDateTime {
        let local = at.to_offset(self.offset);
        PrimitiveDateTime::new(local.date(), local.time())
    }
}

/// Parse `+HH:MM` / `-HH:MM`, or `Z`/`UTC`.
pub fn parse_offset(s: &str) -> Result<UtcOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(
        s,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .with_context(|| format!("invalid UTC offset '{s}' (expected e.g. +02:00 or -05:30)"))
}

// ===========================================================================
// Tests
// ===========================================================================
