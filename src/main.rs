//! # Tiering — partition lifecycle execution engine
//!
//! Trigger surface for the tiering scheduler.
//!
//! Usage:
//!   tiering run                          # One invocation of the default schedule
//!   tiering run --force                  # Ignore the execution window
//!   tiering run --resume BATCH_...       # Take over from an earlier batch
//!   tiering gate                         # Would a run start now?
//!   tiering daemon                       # Periodic trigger loop
//!   tiering status --json                # Queue and batch state

use anyhow::{Context, Result};
use chrono::Weekday;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tiering_core::TieringConfig;
use tiering_scheduler::persistence::MAX_PARTITIONS_PER_BATCH;
use tiering_scheduler::schedule::ALL_WEEKDAYS;
use tiering_scheduler::{
    DryRunExecutor, ExecutionLog, ExecutionOrchestrator, ScheduleConfig, SystemClock, TieringDb,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tiering", version, about = "🗄️ Tiering — windowed partition lifecycle execution")]
struct Cli {
    /// Config file (default: ~/.tiering/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides [database] path)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator once, until the window closes or the queue drains
    Run {
        #[arg(short, long)]
        schedule: Option<String>,
        /// Bypass every window check
        #[arg(long)]
        force: bool,
        /// Batch id of an interrupted run to take over from
        #[arg(long)]
        resume: Option<String>,
    },
    /// Evaluate the should-execute gate without running anything
    Gate {
        #[arg(short, long)]
        schedule: Option<String>,
    },
    /// Wake periodically and run whenever the gate opens
    Daemon {
        #[arg(short, long)]
        schedule: Option<String>,
        /// Seconds between gate checks (default: [engine] trigger_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Queue summary and recent batches
    Status {
        #[arg(short, long)]
        schedule: Option<String>,
        #[arg(long, default_value = "10")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Execution log entries
    Log {
        /// Only entries of this batch
        #[arg(long)]
        batch: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Release orphaned queue items back to PENDING
    Recover {
        /// Only items of this batch
        #[arg(long)]
        batch: Option<String>,
    },
    /// Manage schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Engine settings stored in the database
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Create or update a schedule
    Set(ScheduleSetArgs),
    /// Print a schedule
    Show { name: Option<String> },
}

#[derive(Args)]
struct ScheduleSetArgs {
    name: String,
    /// Same window (HH:MM-HH:MM) on every day
    #[arg(long)]
    every_day: Option<String>,
    /// Per-day window, e.g. --window mon=02:00-04:00 (empty clears the day)
    #[arg(long, value_parser = parse_day_window)]
    window: Vec<(Weekday, String)>,
    #[arg(long)]
    cooldown_minutes: Option<u32>,
    #[arg(long)]
    checkpointing: Option<bool>,
    #[arg(long)]
    checkpoint_frequency: Option<u32>,
    /// Enable or disable the schedule (new schedules start enabled)
    #[arg(long)]
    enabled: Option<bool>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a value, e.g. `config set MAX_PARTITIONS_PER_BATCH 25`
    Set { key: String, value: String },
    /// Print a value
    Get { key: String },
}

fn parse_day_window(s: &str) -> std::result::Result<(Weekday, String), String> {
    let (day, hours) = s
        .split_once('=')
        .ok_or_else(|| format!("expected DAY=HH:MM-HH:MM, got '{s}'"))?;
    let day: Weekday = day
        .trim()
        .parse()
        .map_err(|_| format!("unknown weekday '{day}'"))?;
    Ok((day, hours.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tiering=debug,tiering_scheduler=debug"
    } else {
        "tiering=info,tiering_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => TieringConfig::load_from(path)?,
        None => TieringConfig::load()?,
    };
    let db_path = match &cli.db {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => config.database.resolved_path(),
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let db = Arc::new(TieringDb::open(&db_path)?);
    let schedule_or_default =
        |s: &Option<String>| s.clone().unwrap_or_else(|| config.engine.default_schedule.clone());

    match &cli.command {
        Command::Run { schedule, force, resume } => {
            let orchestrator = orchestrator(&config, db.clone(), &db_path)?;
            let report = orchestrator
                .execute(&schedule_or_default(schedule), resume.as_deref(), *force)
                .await?;
            println!("🏁 {} — {}", report.schedule_name, report.exit_reason);
            for b in &report.batches {
                match &b.outcome {
                    Some(o) => println!(
                        "   {} {}: {} ok, {} failed{}",
                        b.batch_id,
                        b.status.as_str(),
                        o.completed,
                        o.failed,
                        if o.stopped_by_window { " (window closed)" } else { "" }
                    ),
                    None => println!(
                        "   {} {}: {}",
                        b.batch_id,
                        b.status.as_str(),
                        b.error.as_deref().unwrap_or("")
                    ),
                }
            }
        }
        Command::Gate { schedule } => {
            let orchestrator = orchestrator(&config, db.clone(), &db_path)?;
            let name = schedule_or_default(schedule);
            let decision = orchestrator.guard().evaluate(&name)?;
            println!("{name}: {decision:?}");
        }
        Command::Daemon { schedule, interval } => {
            let orchestrator = Arc::new(orchestrator(&config, db.clone(), &db_path)?);
            let interval = interval.unwrap_or(config.engine.trigger_interval_secs).max(1);
            let name = schedule_or_default(schedule);
            println!("🗄️ Tiering v{}", env!("CARGO_PKG_VERSION"));
            println!("   📅 Schedule:  {name}");
            println!("   ⏰ Interval:  {interval}s");
            println!("   🗄️  Database:  {}", db_path.display());
            tokio::select! {
                _ = tiering_scheduler::spawn_trigger(orchestrator, name, Duration::from_secs(interval)) => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("🛑 Shutting down"),
            }
        }
        Command::Status { schedule, limit, json } => {
            let name = schedule_or_default(schedule);
            let running = db.running_batch(&name)?;
            let queue = db.queue_summary()?;
            let batches = db.recent_execution_states(*limit)?;
            if *json {
                let out = serde_json::json!({
                    "schedule": name,
                    "running": running,
                    "pending": db.count_pending()?,
                    "orphans": db.count_orphans()?,
                    "queue": queue.iter().map(|(s, n)| serde_json::json!({"status": s, "count": n})).collect::<Vec<_>>(),
                    "batches": batches,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("📅 {name}: {}", match &running {
                    Some(s) => format!("RUNNING ({})", s.batch_id),
                    None => "idle".into(),
                });
                println!("📋 Queue:");
                for (status, count) in &queue {
                    println!("   {status:<10} {count}");
                }
                println!("   pending (selectable) {}, orphaned {}", db.count_pending()?, db.count_orphans()?);
                println!("📦 Recent batches:");
                for s in &batches {
                    println!(
                        "   {} {:<9} {} ok / {} failed of {} ({:.0}s)",
                        s.batch_id,
                        s.status.as_str(),
                        s.completed_operations,
                        s.failed_operations,
                        s.total_operations,
                        s.elapsed_seconds
                    );
                }
            }
        }
        Command::Log { batch, limit, json } => {
            let log = ExecutionLog::open(&db_path)?;
            let entries = match batch {
                Some(id) => log.entries_for_batch(id)?,
                None => log.recent(*limit)?,
            };
            if *json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for e in &entries {
                    println!(
                        "{} {:<8} {:<9} {}.{}:{} ({:.1}s){}",
                        e.start_time.format("%Y-%m-%d %H:%M:%S"),
                        e.status.as_str(),
                        e.action_type,
                        e.table_owner,
                        e.table_name,
                        e.partition_name,
                        e.duration_seconds,
                        e.error_message.as_deref().map(|m| format!(" — {m}")).unwrap_or_default()
                    );
                }
            }
        }
        Command::Recover { batch } => {
            let released = db.release_orphans(batch.as_deref())?;
            println!("♻️ Released {released} orphaned item(s)");
        }
        Command::Schedule { action } => match action {
            ScheduleAction::Set(args) => {
                let mut schedule = match db.find_schedule(&args.name)? {
                    Some(existing) => existing,
                    None => ScheduleConfig::new(&args.name),
                };
                if let Some(hours) = &args.every_day {
                    schedule = schedule.every_day(hours);
                }
                for (day, hours) in &args.window {
                    schedule.windows.set(*day, Some(hours.clone()).filter(|h| !h.is_empty()));
                }
                if let Some(m) = args.cooldown_minutes {
                    schedule.batch_cooldown_minutes = m;
                }
                if let Some(c) = args.checkpointing {
                    schedule.enable_checkpointing = c;
                }
                if let Some(f) = args.checkpoint_frequency {
                    schedule.checkpoint_frequency = f;
                }
                if let Some(enabled) = args.enabled {
                    schedule.enabled = enabled;
                }
                schedule.validate()?;
                db.save_schedule(&schedule)?;
                println!("✅ Schedule '{}' saved", schedule.schedule_name);
            }
            ScheduleAction::Show { name } => {
                let name = schedule_or_default(name);
                let schedule = db
                    .find_schedule(&name)?
                    .ok_or(tiering_core::TieringError::ScheduleNotFound(name))?;
                println!("📅 {} ({})", schedule.schedule_name, if schedule.enabled { "enabled" } else { "disabled" });
                for day in ALL_WEEKDAYS {
                    println!("   {day}: {}", schedule.windows.get(day).unwrap_or("—"));
                }
                println!("   cooldown: {} min", schedule.batch_cooldown_minutes);
                println!(
                    "   checkpointing: {} (every {} items)",
                    schedule.enable_checkpointing, schedule.checkpoint_frequency
                );
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Set { key, value } => {
                db.set_config_value(key, value)?;
                println!("✅ {key} = {value}");
            }
            ConfigAction::Get { key } => {
                if key == MAX_PARTITIONS_PER_BATCH {
                    println!("{}", db.max_partitions_per_batch()?);
                } else {
                    match db.get_config_value(key)? {
                        Some(v) => println!("{v}"),
                        None => println!("(unset)"),
                    }
                }
            }
        },
    }

    Ok(())
}

fn orchestrator(
    config: &TieringConfig,
    db: Arc<TieringDb>,
    db_path: &std::path::Path,
) -> Result<ExecutionOrchestrator> {
    if !config.engine.dry_run {
        anyhow::bail!(
            "no storage executor is linked into this binary; set [engine] dry_run = true \
             or embed tiering-scheduler with your own ActionExecutor"
        );
    }
    let log = Arc::new(ExecutionLog::open(db_path)?);
    Ok(ExecutionOrchestrator::new(
        db,
        log,
        Arc::new(DryRunExecutor),
        Arc::new(SystemClock),
        config.engine.orphan_policy,
    ))
}
