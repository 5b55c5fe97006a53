//! # MarkSafe — unattended bookmark backup scheduler
//!
//! Usage:
//!   marksafe run                              # Register the three timers and run until Ctrl-C
//!   marksafe tick retry-check                 # Run one check and exit (for cron/systemd timers)
//!   marksafe backup-now                       # Start a manual backup
//!   marksafe status                           # Schedule, ledger, queue and device state
//!   marksafe schedule set --frequency weekly --day-of-week 1 --hour 3
//!   marksafe init-config                      # Write the default config file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use marksafe_core::MarkSafeConfig;
use marksafe_core::traits::{ExecutionEngine, StateStore, SystemClock};
use marksafe_core::types::ScheduleInput;
use marksafe_scheduler::{
    Alarm, AlarmManager, AlarmPeriods, HttpEngine, JsonFileStore, MemoryStore, SqliteStore,
    SystemProbe, spawn_alarms,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "marksafe",
    version,
    about = "🔖 MarkSafe — resource-aware periodic bookmark backups"
)]
struct Cli {
    /// Config file (default: ~/.marksafe/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Run a single check and exit
    Tick {
        /// scheduled-check, retry-check or missed-check
        alarm: Alarm,
    },
    /// Start a manual backup and wait for the engine's reply
    BackupNow,
    /// Print schedule, ledger summary, missed-work queue and device state
    Status,
    /// Show or change the backup schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleCommand,
    },
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    Show,
    Set(ScheduleArgs),
}

/// Unset fields keep their current value.
#[derive(Args)]
struct ScheduleArgs {
    /// hourly, daily, weekly, biweekly or monthly
    #[arg(long)]
    frequency: Option<String>,
    #[arg(long)]
    hour: Option<i64>,
    #[arg(long)]
    minute: Option<i64>,
    /// 0 = Sunday … 6 = Saturday
    #[arg(long)]
    day_of_week: Option<i64>,
    /// 1–31, clamped to the month's last day
    #[arg(long)]
    day_of_month: Option<i64>,
    /// -1 (keep all), 5, 10, 20 or 50
    #[arg(long, allow_hyphen_values = true)]
    retention: Option<i64>,
    /// Turn scheduled backups off
    #[arg(long, conflicts_with = "enable")]
    disable: bool,
    /// Turn scheduled backups on
    #[arg(long)]
    enable: bool,
}

impl ScheduleArgs {
    fn apply(self, mut input: ScheduleInput) -> ScheduleInput {
        if let Some(frequency) = self.frequency {
            input.frequency = frequency;
        }
        if let Some(hour) = self.hour {
            input.hour = hour;
        }
        if let Some(minute) = self.minute {
            input.minute = minute;
        }
        if self.day_of_week.is_some() {
            input.day_of_week = self.day_of_week;
        }
        if self.day_of_month.is_some() {
            input.day_of_month = self.day_of_month;
        }
        if let Some(retention) = self.retention {
            input.retention_count = retention;
        }
        if self.disable {
            input.enabled = false;
        } else if self.enable {
            input.enabled = true;
        }
        input
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
        .unwrap_or_else(MarkSafeConfig::default_path)
}

fn open_store(config: &MarkSafeConfig) -> Result<Arc<dyn StateStore>> {
    let custom = config
        .store
        .path
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()));
    let store: Arc<dyn StateStore> = match config.store.backend.as_str() {
        "json" => {
            let dir = custom.unwrap_or_else(|| config.data_path().join("state"));
            Arc::new(JsonFileStore::open(&dir)?)
        }
        "sqlite" => {
            let path = custom.unwrap_or_else(|| config.data_path().join("marksafe.db"));
            Arc::new(SqliteStore::open(&path)?)
        }
        "memory" => {
            tracing::warn!("⚠️ Using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
        other => anyhow::bail!("unknown store backend '{other}' (expected json, sqlite or memory)"),
    };
    tracing::debug!("💾 State store: {}", store.name());
    Ok(store)
}

fn build_manager(config: &MarkSafeConfig) -> Result<Arc<AlarmManager>> {
    let store = open_store(config)?;
    let engine: Arc<dyn ExecutionEngine> = Arc::new(HttpEngine::new(&config.engine)?);
    let probe = Arc::new(SystemProbe::new(&config.resources));
    Ok(Arc::new(AlarmManager::new(
        config,
        store,
        engine,
        probe,
        Arc::new(SystemClock),
    )))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "marksafe=debug,marksafe_scheduler=debug"
    } else {
        "marksafe=info,marksafe_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let path = config_path(&cli);

    if let Command::InitConfig { force } = cli.command {
        if path.exists() && !force {
            println!("⚠️  Config already exists at {} (use --force to overwrite)", path.display());
            return Ok(());
        }
        MarkSafeConfig::default().save_to(&path)?;
        println!("✅ Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = if path.exists() {
        MarkSafeConfig::load_from(&path)
            .with_context(|| format!("loading {}", path.display()))?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        MarkSafeConfig::default()
    };
    let manager = build_manager(&config)?;

    match cli.command {
        Command::Run => {
            println!("🔖 MarkSafe v{}", env!("CARGO_PKG_VERSION"));
            let handles = spawn_alarms(manager.clone(), AlarmPeriods::from(&config.alarms));
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down; waiting for in-flight backups");
            for handle in &handles {
                handle.abort();
            }
            let drained = manager.wait_for_dispatches().await;
            tracing::info!("👋 Stopped ({drained} dispatch(es) drained)");
        }
        Command::Tick { alarm } => {
            let report = manager.run_alarm(alarm).await?;
            manager.wait_for_dispatches().await;
            print_json(&report)?;
        }
        Command::BackupNow => {
            let record = manager.run_manual_backup().await?;
            println!("🚀 Started manual backup {}", record.id);
            manager.wait_for_dispatches().await;
            if let Some(record) = manager.ledger().get_backup(&record.id).await? {
                print_json(&record)?;
            }
        }
        Command::Status => {
            print_json(&manager.status().await?)?;
        }
        Command::Schedule { action } => match action {
            ScheduleCommand::Show => {
                let schedule = manager.get_schedule().await?;
                println!("📅 {schedule}");
                print_json(&schedule)?;
            }
            ScheduleCommand::Set(args) => {
                let current = manager.get_schedule().await?;
                let input = args.apply(ScheduleInput::from(&current));
                let schedule = manager.update_schedule(&input).await?;
                println!("✅ Schedule updated: {schedule}");
                if let Some(next) = schedule.next_backup_time {
                    println!("   Next backup: {}", next.with_timezone(&chrono::Local));
                }
            }
        },
        Command::InitConfig { .. } => {}
    }

    Ok(())
}
