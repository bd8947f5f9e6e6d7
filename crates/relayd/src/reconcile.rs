//! Reconciliation: compare the schedule's desired relay position with the
//! hardware's actual position and issue at most one corrective command.
//!
//! One call to [`Reconciler::reconcile`] performs:
//!
//! ```text
//! schedule ──▶ desired_state ─┐
//!                             ├─ equal ──▶ NoAction
//! relay.read_state ───────────┘
//!                             └─ differ ─▶ relay.set_state ──▶ activation log
//! ```
//!
//! Relay state is re-read from the hardware on every call and never cached,
//! so manual toggles made out-of-band are picked up on the next tick.  Nothing
//! here retries; the next tick re-evaluates from scratch.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use time::PrimitiveDateTime;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::clock::LocalClock;
use crate::relay::{RelayControl, RelayState, Switch};
use crate::schedule::{desired_state, format_hhmm, Schedule};

// ---------------------------------------------------------------------------
// Collaborator contracts
// ---------------------------------------------------------------------------

/// Read side of the schedule persistence.
pub trait ScheduleStore: Send + Sync {
    fn get_schedule(&self, device_id: &str)
        -> impl Future<Output = anyhow::Result<Option<Schedule>>> + Send;

    /// Every device that currently has a schedule row (enabled or not).
    fn scheduled_devices(&self) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;
}

/// Append-only sink for activation records.
pub trait ActivationLog: Send + Sync {
    fn append(&self, rec: &ActivationRecord) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Who caused a relay switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The periodic schedule enforcement.
    System,
    /// An operator, by name.
    User(String),
}

impl Actor {
    /// Name written to the activation log.
    pub fn name(&self) -> &str {
        match self {
            Actor::System => "schedule",
            Actor::User(name) => name,
        }
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self, Actor::System)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRecord {
    pub device_id: String,
    pub action: Switch,
    pub actor: Actor,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoAction,
    TurnedOn,
    TurnedOff,
}

impl From<Switch> for Outcome {
    fn from(s: Switch) -> Self {
        match s {
            Switch::On => Outcome::TurnedOn,
            Switch::Off => Outcome::TurnedOff,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{device_id}: schedule lookup failed: {reason}")]
    Store { device_id: String, reason: String },
    #[error("{device_id}: relay unavailable: {reason}")]
    RelayUnavailable { device_id: String, reason: String },
    #[error("{device_id}: relay command failed: {reason}")]
    RelayCommandFailed { device_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler<S, R, L> {
    store: S,
    relays: R,
    log: L,
    clock: LocalClock,
    relay_timeout: Duration,
}

impl<S, R, L> Reconciler<S, R, L>
where
    S: ScheduleStore,
    R: RelayControl,
    L: ActivationLog,
{
    pub fn new(store: S, relays: R, log: L, clock: LocalClock, relay_timeout: Duration) -> Self {
        Self {
            store,
            relays,
            log,
            clock,
            relay_timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &LocalClock {
        &self.clock
    }

    /// Reconcile `device_id` against the local wall-clock time.
    pub async fn reconcile(&self, device_id: &str) -> Result<Outcome, ReconcileError> {
        self.reconcile_at(device_id, self.clock.now()).await
    }

    /// Reconcile `device_id` as if the local time were `now`.
    pub async fn reconcile_at(
        &self,
        device_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Outcome, ReconcileError> {
        let schedule = match self.store.get_schedule(device_id).await {
            Ok(Some(s)) if s.enabled => s,
            Ok(Some(_)) => {
                debug!(device = %device_id, "schedule disabled — not enforcing");
                return Ok(Outcome::NoAction);
            }
            Ok(None) => {
                debug!(device = %device_id, "no schedule — not enforcing");
                return Ok(Outcome::NoAction);
            }
            Err(e) => {
                return Err(ReconcileError::Store {
                    device_id: device_id.to_string(),
                    reason: format!("{e:#}"),
                })
            }
        };

        let desired = desired_state(now.weekday(), now.time(), &schedule);
        let actual = self.read(device_id).await?;

        if actual.matches(desired) {
            debug!(device = %device_id, %desired, "relay already in scheduled state");
            return Ok(Outcome::NoAction);
        }

        info!(
            device = %device_id,
            ?actual,
            %desired,
            on = %format_hhmm(schedule.on_time),
            off = %format_hhmm(schedule.off_time),
            days = %schedule.days,
            "schedule mismatch — switching relay"
        );

        self.switch(device_id, desired, Actor::System).await?;
        Ok(Outcome::from(desired))
    }

    /// Operator-initiated switch.  Issues exactly one command and records it,
    /// whether or not the command succeeded.
    pub async fn switch_manual(
        &self,
        device_id: &str,
        to: Switch,
        user: &str,
    ) -> Result<(), ReconcileError> {
        info!(device = %device_id, state = %to, user = %user, "manual relay switch");
        self.switch(device_id, to, Actor::User(user.to_string())).await
    }

    /// Current hardware state, bounded by the relay timeout.
    pub async fn read(&self, device_id: &str) -> Result<RelayState, ReconcileError> {
        let unavailable = |reason: String| ReconcileError::RelayUnavailable {
            device_id: device_id.to_string(),
            reason,
        };
        match timeout(self.relay_timeout, self.relays.read_state(device_id)).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(e)) => Err(unavailable(e.to_string())),
            Err(_) => Err(unavailable(format!(
                "no answer within {}s",
                self.relay_timeout.as_secs_f32()
            ))),
        }
    }

    async fn switch(&self, device_id: &str, to: Switch, actor: Actor) -> Result<(), ReconcileError> {
        let result = match timeout(self.relay_timeout, self.relays.set_state(device_id, to)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no answer within {}s",
                self.relay_timeout.as_secs_f32()
            )),
        };

        let rec = ActivationRecord {
            device_id: device_id.to_string(),
            action: to,
            actor,
            success: result.is_ok(),
        };
        // The relay has already moved (or failed to); a lost audit row must
        // not change the outcome.
        if let Err(e) = self.log.append(&rec).await {
            error!(device = %device_id, action = %to, "activation log append failed: {e:#}");
        }

        result.map_err(|reason| ReconcileError::RelayCommandFailed {
            device_id: device_id.to_string(),
            reason,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
