mod cli;
mod clock;
mod config;
mod db;
mod reconcile;
mod relay;
mod schedule;
mod scheduler;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, HistoryRange, ScheduleCommand};
use clock::LocalClock;
use config::Config;
use db::{now_unix, ActivationQuery, Db};
use reconcile::Reconciler;
use relay::{BoardOptions, RelayBoard};
use schedule::Schedule;

type Controller = Reconciler<Db, RelayBoard, Db>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Read the local offset while the process is still single-threaded.
    let clock = match cli.utc_offset {
        Some(offset) => LocalClock::new(offset),
        None => LocalClock::detect(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(dispatch(cli, clock))
}

async fn dispatch(mut cli: Cli, clock: LocalClock) -> Result<()> {
    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cli.db_url).await?;
    db.migrate().await?;

    // ── Config file (declare devices, seed schedules) ───────────────
    let cfg = config::load(&cli.config)?;
    config::apply(&cfg, &db).await?;

    match cli.command.take().unwrap_or(Command::Run) {
        Command::Run => {
            let controller = controller(&cli, &cfg, &db, clock)?;
            run(&controller, &cfg, &cli).await
        }
        Command::Tick => {
            let controller = controller(&cli, &cfg, &db, clock)?;
            let summary = scheduler::run_once(&controller, &cfg.device_ids()).await;
            print_json(&summary)?;
            if summary.failed > 0 {
                bail!("{} device(s) failed to reconcile", summary.failed);
            }
            Ok(())
        }
        Command::Status => {
            let controller = controller(&cli, &cfg, &db, clock)?;
            status(&controller, &cfg).await
        }
        Command::Set { device, state, user } => {
            require_device(&cfg, &device)?;
            let controller = controller(&cli, &cfg, &db, clock)?;
            controller.switch_manual(&device, state, &user).await?;
            print_json(&json!({ "device_id": device, "state": state, "user": user }))
        }
        Command::Schedule { action } => schedule_command(&cfg, &db, action).await,
        Command::History {
            device,
            range,
            limit,
            summary,
        } => history(&db, device, range, limit, summary).await,
    }
}

fn controller(cli: &Cli, cfg: &Config, db: &Db, clock: LocalClock) -> Result<Controller> {
    let opts = BoardOptions {
        pitest_bin: cli.pitest_bin.clone(),
        active_low: cli.active_low,
    };
    let board = RelayBoard::new(&cfg.device_ids(), opts)?;
    Ok(Reconciler::new(
        db.clone(),
        board,
        db.clone(),
        clock,
        Duration::from_secs(cli.relay_timeout_sec),
    ))
}

fn require_device(cfg: &Config, device_id: &str) -> Result<()> {
    if cfg.device(device_id).is_none() {
        bail!("unknown device '{device_id}' (not declared in the config file)");
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(controller: &Controller, cfg: &Config, cli: &Cli) -> Result<()> {
    if cfg.devices.is_empty() {
        warn!("no devices declared in {}", cli.config);
    }
    info!(devices = cfg.devices.len(), db = %cli.db_url, "relayd started");

    for d in &cfg.devices {
        match controller.read(&d.device_id).await {
            Ok(state) => info!(device = %d.device_id, name = %d.name, state = state.as_str(), "initial relay state"),
            Err(e) => warn!(device = %d.device_id, name = %d.name, "{e}"),
        }
    }

    scheduler::run(controller, &cfg.device_ids(), Duration::from_secs(cli.tick_sec)).await;
    Ok(())
}

#[derive(Serialize)]
struct DeviceStatus<'a> {
    name: &'a str,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn status(controller: &Controller, cfg: &Config) -> Result<()> {
    let mut out: BTreeMap<&str, DeviceStatus> = BTreeMap::new();
    for d in &cfg.devices {
        let entry = match controller.read(&d.device_id).await {
            Ok(state) => DeviceStatus {
                name: &d.name,
                state: state.as_str(),
                error: None,
            },
            Err(e) => DeviceStatus {
                name: &d.name,
                state: "ERROR",
                error: Some(e.to_string()),
            },
        };
        out.insert(&d.device_id, entry);
    }
    print_json(&out)
}

async fn schedule_command(cfg: &Config, db: &Db, action: ScheduleCommand) -> Result<()> {
    match action {
        ScheduleCommand::Show { device: Some(device) } => match db.get_schedule(&device).await? {
            Some(s) => print_json(&s),
            None => bail!("no schedule stored for '{device}'"),
        },
        ScheduleCommand::Show { device: None } => print_json(&db.load_schedules().await?),
        ScheduleCommand::Set {
            device,
            on,
            off,
            days,
            enable,
        } => {
            require_device(cfg, &device)?;
            let existing = db.get_schedule(&device).await?;
            let schedule = Schedule {
                device_id: device,
                on_time: on,
                off_time: off,
                days,
                enabled: enable || existing.is_some_and(|s| s.enabled),
                updated_at: now_unix(),
            };
            if schedule.is_degenerate() {
                warn!(device = %schedule.device_id, "on and off times are equal; this schedule never switches on");
            }
            db.upsert_schedule(&schedule).await?;
            info!(
                device = %schedule.device_id,
                days = %schedule.days,
                overnight = schedule.is_overnight(),
                enabled = schedule.enabled,
                "schedule saved"
            );
            print_json(&schedule)
        }
        ScheduleCommand::Enable { device } => set_enabled(cfg, db, &device, true).await,
        ScheduleCommand::Disable { device } => set_enabled(cfg, db, &device, false).await,
        ScheduleCommand::Delete { device } => {
            require_device(cfg, &device)?;
            if !db.delete_schedule(&device).await? {
                bail!("no schedule stored for '{device}'");
            }
            info!(device = %device, "schedule deleted");
            print_json(&json!({ "device_id": device, "deleted": true }))
        }
    }
}

async fn set_enabled(cfg: &Config, db: &Db, device: &str, enabled: bool) -> Result<()> {
    require_device(cfg, device)?;
    if !db.set_schedule_enabled(device, enabled).await? {
        bail!("no schedule stored for '{device}'");
    }
    info!(device = %device, enabled, "schedule updated");
    print_json(&json!({ "device_id": device, "enabled": enabled }))
}

async fn history(
    db: &Db,
    device: Option<String>,
    range: HistoryRange,
    limit: i64,
    summary: bool,
) -> Result<()> {
    let now = now_unix();
    let since = now - range.seconds();

    if summary {
        let counts: Vec<_> = db
            .activation_counts(since)
            .await?
            .into_iter()
            .filter(|c| device.as_deref().map_or(true, |d| c.device_id == d))
            .collect();
        return print_json(&counts);
    }

    let records = db
        .activations(&ActivationQuery {
            since: Some(since),
            until: Some(now),
            device_id: device,
            limit,
        })
        .await?;
    print_json(&records)
}
