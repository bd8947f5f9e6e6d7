use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::reconcile::{ActivationLog, ActivationRecord, ScheduleStore};
use crate::relay::Switch;
use crate::schedule::{format_hhmm, parse_hhmm, Days, Schedule};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One row of the relay activation log.
#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub device_id: String,
    pub action: Switch,
    pub actor: String,
    pub is_automatic: bool,
    pub success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ActivationQuery {
    /// Inclusive lower bound, unix seconds.
    pub since: Option<i64>,
    /// Inclusive upper bound, unix seconds.
    pub until: Option<i64>,
    pub device_id: Option<String>,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationCount {
    pub device_id: String,
    pub action: String,
    pub total: i64,
    pub failed: i64,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/revpi-relayd/relayd.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database; keep exactly one
        // alive for the lifetime of the pool.
        let in_memory = db_url.contains(":memory:");
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_opts
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn upsert_schedule(&self, s: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (device_id, on_time, off_time, days, enabled, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              on_time=excluded.on_time,
              off_time=excluded.off_time,
              days=excluded.days,
              enabled=excluded.enabled,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(&s.device_id)
        .bind(format_hhmm(s.on_time))
        .bind(format_hhmm(s.off_time))
        .bind(s.days.to_string())
        .bind(s.enabled)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await
        .context("upsert_schedule failed")?;
        Ok(())
    }

    /// Seed `s` from the config file.  A device is seeded at most once: a
    /// schedule that was edited or deleted afterwards is left as it is.
    /// Returns whether a row was written.
    pub async fn seed_schedule(&self, s: &Schedule) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("seed_schedule: begin failed")?;

        let marked = sqlx::query(
            r#"
            INSERT INTO seeded_schedules (device_id, seeded_at)
            VALUES (?, ?)
            ON CONFLICT(device_id) DO NOTHING
            "#,
        )
        .bind(&s.device_id)
        .bind(now_unix())
        .execute(&mut *tx)
        .await
        .context("seed_schedule: mark failed")?;

        if marked.rows_affected() == 0 {
            return Ok(false);
        }

        let res = sqlx::query(
            r#"
            INSERT INTO schedules (device_id, on_time, off_time, days, enabled, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO NOTHING
            "#,
        )
        .bind(&s.device_id)
        .bind(format_hhmm(s.on_time))
        .bind(format_hhmm(s.off_time))
        .bind(s.days.to_string())
        .bind(s.enabled)
        .bind(s.updated_at)
        .execute(&mut *tx)
        .await
        .context("seed_schedule: insert failed")?;

        tx.commit().await.context("seed_schedule: commit failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn get_schedule(&self, device_id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query(
            r#"
            SELECT device_id, on_time, off_time, days, enabled, updated_at
            FROM schedules
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_schedule failed")?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    pub async fn load_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, on_time, off_time, days, enabled, updated_at
            FROM schedules
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_schedules failed")?;

        rows.iter().map(schedule_from_row).collect()
    }

    /// Returns false when the device has no schedule.
    pub async fn set_schedule_enabled(&self, device_id: &str, enabled: bool) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE schedules
            SET enabled = ?, updated_at = ?
            WHERE device_id = ?
            "#,
        )
        .bind(enabled)
        .bind(now_unix())
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("set_schedule_enabled failed")?;
        Ok(res.rows_affected() > 0)
    }

    /// Returns false when the device has no schedule.
    pub async fn delete_schedule(&self, device_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM schedules WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Relay activations
    // ----------------------------

    pub async fn insert_activation(&self, ts: i64, rec: &ActivationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_activations (ts, device_id, action, actor, is_automatic, success)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(&rec.device_id)
        .bind(rec.action.as_str())
        .bind(rec.actor.name())
        .bind(rec.actor.is_automatic())
        .bind(rec.success)
        .execute(&self.pool)
        .await
        .context("insert_activation failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn activations(&self, q: &ActivationQuery) -> Result<Vec<Activation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, device_id, action, actor, is_automatic, success
            FROM relay_activations
            WHERE (?1 IS NULL OR ts >= ?1)
              AND (?2 IS NULL OR ts <= ?2)
              AND (?3 IS NULL OR device_id = ?3)
            ORDER BY ts DESC, id DESC
            LIMIT ?4
            "#,
        )
        .bind(q.since)
        .bind(q.until)
        .bind(q.device_id.as_deref())
        .bind(q.limit)
        .fetch_all(&self.pool)
        .await
        .context("activations query failed")?;

        rows.iter().map(activation_from_row).collect()
    }

    /// Per-device, per-action totals since `since` (unix seconds).
    pub async fn activation_counts(&self, since: i64) -> Result<Vec<ActivationCount>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, action,
                   COUNT(*) AS total,
                   SUM(CASE WHEN success THEN 0 ELSE 1 END) AS failed
            FROM relay_activations
            WHERE ts >= ?
            GROUP BY device_id, action
            ORDER BY device_id, action
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("activation_counts failed")?;

        rows.iter()
            .map(|r| -> Result<ActivationCount> {
                Ok(ActivationCount {
                    device_id: r.try_get("device_id")?,
                    action: r.try_get("action")?,
                    total: r.try_get("total")?,
                    failed: r.try_get("failed")?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn schedule_from_row(r: &SqliteRow) -> Result<Schedule> {
    let device_id: String = r.try_get("device_id")?;
    let on_time: String = r.try_get("on_time")?;
    let off_time: String = r.try_get("off_time")?;
    let days: String = r.try_get("days")?;

    Ok(Schedule {
        on_time: parse_hhmm(&on_time)
            .with_context(|| format!("schedule '{device_id}': bad on_time"))?,
        off_time: parse_hhmm(&off_time)
            .with_context(|| format!("schedule '{device_id}': bad off_time"))?,
        days: Days::from_str(&days)
            .with_context(|| format!("schedule '{device_id}': bad days"))?,
        enabled: r.try_get("enabled")?,
        updated_at: r.try_get("updated_at")?,
        device_id,
    })
}

fn activation_from_row(r: &SqliteRow) -> Result<Activation> {
    let ts: i64 = r.try_get("ts")?;
    let action: String = r.try_get("action")?;
    Ok(Activation {
        id: r.try_get("id")?,
        at: OffsetDateTime::from_unix_timestamp(ts)
            .with_context(|| format!("activation timestamp out of range: {ts}"))?,
        device_id: r.try_get("device_id")?,
        action: Switch::parse(&action)
            .with_context(|| format!("unknown activation action '{action}'"))?,
        actor: r.try_get("actor")?,
        is_automatic: r.try_get("is_automatic")?,
        success: r.try_get("success")?,
    })
}

// ---------------------------------------------------------------------------
// Reconciler collaborators
// ---------------------------------------------------------------------------

impl ScheduleStore for Db {
    async fn get_schedule(&self, device_id: &str) -> Result<Option<Schedule>> {
        Db::get_schedule(self, device_id).await
    }

    async fn scheduled_devices(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT device_id FROM schedules ORDER BY device_id")
            .fetch_all(&self.pool)
            .await
            .context("scheduled_devices failed")?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("device_id").map_err(anyhow::Error::from))
            .collect()
    }
}

impl ActivationLog for Db {
    async fn append(&self, rec: &ActivationRecord) -> Result<()> {
        self.insert_activation(now_unix(), rec).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
