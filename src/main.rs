//! Database backup tool
//!
//! Dumps every database of a Postgres-wire host to local disk or S3, either
//! once or on a cron schedule.

// dbbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod schedule;
mod storage;
mod utils;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use backup::{BackupCycle, CliDumper, SystemRetriever};
use config::{BackupConfig, StorageConfig, load_backup_config};
use schedule::{CronSchedule, HealthRecorder, RetryPolicy, Scheduler, run_with_retry};
use storage::{FileStorage, S3Storage, Storage};

const DEFAULT_CONFIG: &str = "config.json";

#[derive(Parser)]
#[command(name = "dbbackup")]
#[command(about = "Dump every database of a Postgres-wire host to disk or S3")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file (defaults to ./config.json when present)
    #[arg(short, long, env = "BACKUP_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// Log level or filter directive (e.g. debug, info, dbbackup=trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backup databases once and then stop
    Once,

    /// Backup databases on a cron schedule until interrupted
    Cron {
        /// Cron expression; overrides "schedule" from the config file
        #[arg(long, env = "SCHEDULE")]
        schedule: Option<String>,
    },

    /// Probe database connectivity and storage, then exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli.log_level, &cli.log_format) {
        eprintln!("❌ Error: {:?}", e);
        return ExitCode::FAILURE;
    }

    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let config_path = cli.config.or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG);
        default.is_file().then_some(default)
    });
    let mut config = load_backup_config(config_path.as_deref()).with_context(|| {
        match &config_path {
            Some(path) => format!("Failed to load configuration from {}", path.display()),
            None => "Failed to build default configuration".to_string(),
        }
    })?;
    if let Commands::Cron {
        schedule: Some(expression),
    } = &cli.command
    {
        config.schedule = Some(CronSchedule::parse(expression)?);
    }

    let cancel = setup_signal_handler();
    let cycle = build_cycle(&config).await;
    let recorder = HealthRecorder::new();

    match cli.command {
        Commands::Once => run_once(&cycle, config.retry, &recorder, &cancel).await,
        Commands::Cron { .. } => {
            let schedule = config.schedule.clone().ok_or_else(|| {
                anyhow!(
                    "cron needs a schedule: pass --schedule, set SCHEDULE \
                     or add \"schedule\" to the config file"
                )
            })?;
            run_cron(&cycle, schedule, config.retry, &recorder, &cancel).await
        }
        Commands::Check => run_check(&cycle, &recorder).await,
    }
}

async fn build_cycle(config: &BackupConfig) -> BackupCycle {
    let storage: Arc<dyn Storage> = match &config.storage {
        StorageConfig::File { dir } => {
            let storage = FileStorage::new(dir.clone());
            info!(dir = %storage.dir().display(), "Using file storage");
            Arc::new(storage)
        }
        StorageConfig::S3(spaces) => {
            info!(bucket = %spaces.bucket_name, "Using S3 storage");
            Arc::new(S3Storage::connect(spaces).await)
        }
    };

    BackupCycle::new(
        Arc::new(SystemRetriever::new(&config.dsn)),
        Arc::new(CliDumper::new(config.dump.clone())),
        storage,
        config.cycle.clone(),
    )
}

async fn run_once(
    cycle: &BackupCycle,
    policy: RetryPolicy,
    recorder: &HealthRecorder,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Performing backup once...");
    let result = run_with_retry(policy, cancel, recorder, |token| async move {
        cycle.run(&token).await
    })
    .await;
    cycle.quiesce().await;

    match result {
        Ok(outcome) => {
            info!(
                cycle_id = %outcome.cycle_id,
                databases = outcome.succeeded,
                "Backup completed"
            );
            Ok(())
        }
        Err(failed) if failed.is_cancelled() => {
            warn!("Backup cancelled by shutdown signal");
            Ok(())
        }
        Err(failed) => Err(failed).context("Backup process failed"),
    }
}

async fn run_cron(
    cycle: &BackupCycle,
    schedule: CronSchedule,
    policy: RetryPolicy,
    recorder: &HealthRecorder,
    cancel: &CancellationToken,
) -> Result<()> {
    let health = recorder.handle(cycle.dumper());
    let startup = health.report().await;
    if let Some(detail) = &startup.db_connection.detail {
        warn!(error = %detail, "Database is not reachable yet; scheduled runs will retry");
    }

    let scheduler = Scheduler::new(schedule, policy, recorder.clone());
    scheduler
        .run(cancel, |token| async move { cycle.run(&token).await })
        .await;
    cycle.quiesce().await;

    let state = health.state();
    info!(
        cycles_succeeded = state.cycles_succeeded,
        cycles_failed = state.cycles_failed,
        errors_seen = state.errors_seen,
        "Scheduler stopped"
    );
    Ok(())
}

async fn run_check(cycle: &BackupCycle, recorder: &HealthRecorder) -> Result<()> {
    let report = recorder.handle(cycle.dumper()).report().await;
    let storage = cycle.storage().check().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Err(e) = &storage {
        error!(error = %e, "Storage check failed");
    }
    if !report.is_healthy() || storage.is_err() {
        bail!("health check failed");
    }
    println!("✅ Database and storage are reachable.");
    Ok(())
}

fn setup_logging(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .with_context(|| format!("invalid log level: {level}"))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format.to_lowercase().as_str() {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => bail!("invalid log format: {other}"),
    }
    Ok(())
}

/// Cancels the returned token on SIGINT or SIGTERM.
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
    cancel_token
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C, shutting down");
}
