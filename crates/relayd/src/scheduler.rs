//! Periodic trigger: once per tick, reconcile every device that has a stored
//! schedule.
//!
//! Ticks never overlap.  A pass runs devices one after another and the next
//! tick is only taken once the pass has finished; a slow pass delays the
//! following tick instead of bursting to catch up.  The device list is
//! re-read every pass so schedule edits apply on the next tick.  Stored
//! schedules of devices that are not declared in the config are skipped.

use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::reconcile::{ActivationLog, Outcome, Reconciler, ScheduleStore};
use crate::relay::RelayControl;

/// Result of one reconciliation pass over all scheduled devices.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub checked: usize,
    pub turned_on: usize,
    pub turned_off: usize,
    pub failed: usize,
}

impl TickSummary {
    pub fn switched(&self) -> usize {
        self.turned_on + self.turned_off
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run the tick loop until Ctrl-C.
pub async fn run<S, R, L>(reconciler: &Reconciler<S, R, L>, declared: &[String], tick: Duration)
where
    S: ScheduleStore,
    R: RelayControl,
    L: ActivationLog,
{
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(tick_sec = tick.as_secs(), offset = %reconciler.clock().offset(), "scheduler started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_once(reconciler, declared).await;
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!("failed to listen for shutdown signal: {e}");
                }
                info!("scheduler stopping");
                break;
            }
        }
    }
}

/// One pass over every scheduled device.  Failures are logged here and
/// counted; the next tick retries naturally.
pub async fn run_once<S, R, L>(reconciler: &Reconciler<S, R, L>, declared: &[String]) -> TickSummary
where
    S: ScheduleStore,
    R: RelayControl,
    L: ActivationLog,
{
    let mut summary = TickSummary::default();

    let devices = match reconciler.store().scheduled_devices().await {
        Ok(d) => d,
        Err(e) => {
            error!("scheduler: listing scheduled devices failed: {e:#}");
            summary.failed += 1;
            return summary;
        }
    };

    for device_id in &devices {
        if !declared.contains(device_id) {
            debug!(device = %device_id, "scheduler: device not declared, skipping");
            continue;
        }
        summary.checked += 1;
        match reconciler.reconcile(device_id).await {
            Ok(Outcome::NoAction) => {}
            Ok(Outcome::TurnedOn) => summary.turned_on += 1,
            Ok(Outcome::TurnedOff) => summary.turned_off += 1,
            Err(e) => {
                error!(device = %device_id, "scheduler: {e}");
                summary.failed += 1;
            }
        }
    }

    debug!(
        checked = summary.checked,
        switched = summary.switched(),
        failed = summary.failed,
        "scheduler tick done"
    );
    summary
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LocalClock;
    use crate::db::{ActivationQuery, Db};
    use crate::relay::{RelayError, RelayState, Switch};
    use crate::schedule::{parse_hhmm, Days, Schedule};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use time::UtcOffset;

    /// In-memory relays; devices missing from the map fail to read.
    struct Relays(Mutex<HashMap<String, RelayState>>);

    impl Relays {
        fn new(states: &[(&str, RelayState)]) -> Self {
            Self(Mutex::new(
                states.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ))
        }

        fn get(&self, device_id: &str) -> Option<RelayState> {
            self.0.lock().unwrap().get(device_id).copied()
        }

        fn put(&self, device_id: &str, to: Switch) {
            self.0.lock().unwrap().insert(device_id.to_string(), to.into());
        }
    }

    impl RelayControl for Relays {
        async fn read_state(&self, device_id: &str) -> Result<RelayState, RelayError> {
            self.get(device_id)
                .ok_or_else(|| RelayError::UnknownDevice(device_id.to_string()))
        }

        async fn set_state(&self, device_id: &str, to: Switch) -> Result<(), RelayError> {
            self.put(device_id, to);
            Ok(())
        }
    }

    /// A schedule that is ON at every moment except the final minute of the
    /// day, whatever the wall clock says when the test runs.
    fn always_on(device_id: &str) -> Schedule {
        Schedule {
            device_id: device_id.into(),
            on_time: parse_hhmm("00:00").unwrap(),
            off_time: parse_hhmm("23:59").unwrap(),
            days: "mon,tue,wed,thu,fri,sat,sun".parse().unwrap(),
            enabled: true,
            updated_at: 0,
        }
    }

    fn never_on(device_id: &str) -> Schedule {
        Schedule {
            days: Days::NONE,
            ..always_on(device_id)
        }
    }

    async fn test_db(schedules: &[Schedule]) -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        for s in schedules {
            db.upsert_schedule(s).await.unwrap();
        }
        db
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn in_last_minute_of_day(clock: &LocalClock) -> bool {
        let now = clock.now();
        now.hour() == 23 && now.minute() == 59
    }

    #[tokio::test]
    async fn pass_switches_mismatched_devices_and_logs_them() {
        let clock = LocalClock::new(UtcOffset::UTC);
        if in_last_minute_of_day(&clock) {
            return; // always_on is OFF during 23:59
        }
        let db = test_db(&[always_on("RelayLight"), never_on("LedLight")]).await;
        let relays = Relays::new(&[
            ("RelayLight", RelayState::Off),
            ("LedLight", RelayState::On),
        ]);
        let r = Reconciler::new(db.clone(), relays, db.clone(), clock, Duration::from_secs(2));
        let declared = ids(&["RelayLight", "LedLight"]);

        let first = run_once(&r, &declared).await;
        assert_eq!(
            first,
            TickSummary { checked: 2, turned_on: 1, turned_off: 1, failed: 0 }
        );

        let second = run_once(&r, &declared).await;
        assert_eq!(second.switched(), 0);
        assert_eq!(second.failed, 0);

        let log = db
            .activations(&ActivationQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|a| a.is_automatic && a.success && a.actor == "schedule"));
    }

    #[tokio::test]
    async fn one_failing_device_does_not_stop_the_pass() {
        let clock = LocalClock::new(UtcOffset::UTC);
        if in_last_minute_of_day(&clock) {
            return;
        }
        let db = test_db(&[always_on("Ghost"), always_on("RelayLight")]).await;
        let relays = Relays::new(&[("RelayLight", RelayState::Off)]);
        let r = Reconciler::new(db.clone(), relays, db.clone(), clock, Duration::from_secs(2));
        let declared = ids(&["Ghost", "RelayLight"]);

        let summary = run_once(&r, &declared).await;
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.turned_on, 1);
    }

    #[tokio::test]
    async fn disabled_and_deleted_schedules_are_left_alone() {
        let db = test_db(&[always_on("RelayLight")]).await;
        db.set_schedule_enabled("RelayLight", false).await.unwrap();
        let relays = Relays::new(&[("RelayLight", RelayState::Off)]);
        let r = Reconciler::new(
            db.clone(),
            relays,
            db.clone(),
            LocalClock::new(UtcOffset::UTC),
            Duration::from_secs(2),
        );
        let declared = ids(&["RelayLight"]);

        let summary = run_once(&r, &declared).await;
        assert_eq!(summary, TickSummary { checked: 1, ..Default::default() });

        db.delete_schedule("RelayLight").await.unwrap();
        assert_eq!(run_once(&r, &declared).await, TickSummary::default());
    }

    #[tokio::test]
    async fn undeclared_devices_are_skipped() {
        let clock = LocalClock::new(UtcOffset::UTC);
        if in_last_minute_of_day(&clock) {
            return;
        }
        let db = test_db(&[always_on("RelayRemoved"), always_on("RelayLight")]).await;
        let relays = Relays::new(&[("RelayLight", RelayState::Off)]);
        let r = Reconciler::new(db.clone(), relays, db.clone(), clock, Duration::from_secs(2));

        let summary = run_once(&r, &ids(&["RelayLight"])).await;
        assert_eq!(
            summary,
            TickSummary { checked: 1, turned_on: 1, turned_off: 0, failed: 0 }
        );
    }
}
