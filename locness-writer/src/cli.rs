///
/// This module implements the CLI interface for locness-writer: command parsing,
/// wiring the DynamoDB store and Google Drive publisher into the core scheduler,
/// and the operational helper commands.
///
/// All pipeline logic (fetching, batching, publishing, the tick loop) lives in the
/// [`locness-writer-core`] crate. This module is CLI glue and orchestration only.
///
/// ## Commands
/// - `run`: poll until Ctrl+C / SIGTERM, then flush and exit
/// - `once`: a single cycle plus flush, report printed as JSON
/// - `health`: static readiness report as JSON
/// - `check-table`: DynamoDB key schema assessment as JSON
/// - `check-drive`: Drive token exchange and target folder listing as JSON
/// - `credentials`: reformat a service-account file for `GOOGLE_CREDENTIALS_JSON`
///
/// Machine-readable output goes to stdout; logs go to stderr.
///
/// [`locness-writer-core`]: ../../locness-writer-core/
use crate::credentials::{to_single_line, ServiceAccountKey};
use crate::drive::{DriveClient, DriveSettings};
use crate::dynamo::{client_for, DynamoStore};
use crate::health::health_check;
use crate::load_config::{load_config, load_valid_config};
use crate::schema::{assess, describe_table, SchemaReport};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use locness_writer_core::config::Config;
use locness_writer_core::scheduler::Scheduler;
use locness_writer_core::synchronise::{CycleReport, PublishSummary, SyncState};
use locness_writer_core::watermark::{initial_watermark, WatermarkFile};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI for locness-writer: hourly CSV snapshots of a DynamoDB table on Google Drive.
#[derive(Parser)]
#[clap(
    name = "locness-writer",
    version,
    about = "Poll a DynamoDB table and publish hourly CSV files to Google Drive"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Log filter (e.g. `debug`, `locness_writer_core=trace`); overrides RUST_LOG
    #[clap(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Poll the table every interval until a termination signal arrives
    Run {
        /// Path to the YAML config file
        #[clap(long, env = "LOCNESS_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Run a single cycle, flush, and print the cycle report
    Once {
        /// Path to the YAML config file
        #[clap(long, env = "LOCNESS_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print a JSON health report (always exits 0)
    Health {
        /// Path to the YAML config file
        #[clap(long, env = "LOCNESS_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Describe the table key schema and whether range queries can be used
    CheckTable {
        /// Path to the YAML config file
        #[clap(long, env = "LOCNESS_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Authenticate against Google Drive and list the target folder
    CheckDrive {
        /// Path to the YAML config file
        #[clap(long, env = "LOCNESS_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Validate a service-account JSON file and print it on a single line
    Credentials {
        /// Path to the downloaded service-account key file
        #[clap(long)]
        file: PathBuf,
    },
}

fn drive_client(config: &Config) -> Result<DriveClient> {
    let key = ServiceAccountKey::from_env().context("Google Drive credentials")?;
    DriveClient::new(
        key,
        DriveSettings {
            folder_id: config.publish.folder_id.clone(),
            shared_drive_id: config.publish.shared_drive_id.clone(),
            timeout: Duration::from_secs(config.publish.timeout_secs),
        },
    )
    .context("Failed to build Google Drive client")
}

/// Wires store, publisher and restored watermark into a ready scheduler.
pub async fn build_scheduler(config: &Config) -> Result<Scheduler<DynamoStore, DriveClient>> {
    let drive = drive_client(config)?;
    drive
        .verify_shared_drive()
        .await
        .context("Shared drive is not accessible")?;

    let store = DynamoStore::connect(&config.store).await;

    let checkpoint = config.watermark.state_file.clone().map(WatermarkFile::new);
    let start = config
        .start_position()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    let watermark = initial_watermark(&start, checkpoint.as_ref(), Utc::now())
        .context("Failed to restore watermark")?;
    tracing::info!(watermark = %watermark.current(), "Watermark initialised");

    let state = SyncState::new(&config.sync_settings(), watermark);
    let scheduler = Scheduler::new(store, drive, state, config.interval());
    Ok(match checkpoint {
        Some(file) => scheduler.with_checkpoint(file),
        None => scheduler,
    })
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn publish_json(summary: &PublishSummary) -> serde_json::Value {
    json!({
        "published": summary.published.iter().map(|p| json!({
            "bucket": p.bucket.to_string(),
            "name": p.name,
            "file_id": p.file_id,
            "rows": p.rows,
            "created": p.created,
        })).collect::<Vec<_>>(),
        "unchanged": summary.unchanged.iter().map(|b| b.to_string()).collect::<Vec<_>>(),
        "failed": summary.failed.iter().map(|f| json!({
            "bucket": f.bucket.to_string(),
            "name": f.name,
            "error": f.error,
        })).collect::<Vec<_>>(),
    })
}

/// JSON rendering of a cycle for the `once` command.
pub fn cycle_json(report: &CycleReport, flush: &PublishSummary) -> serde_json::Value {
    json!({
        "cycle_id": report.cycle_id.to_string(),
        "strategy": format!("{:?}", report.strategy),
        "fetched": report.fetched,
        "accepted": report.accepted,
        "duplicates": report.duplicates,
        "dropped_late": report.dropped_late,
        "malformed": report.malformed,
        "fetch_complete": report.fetch_complete,
        "publish_deferred": report.publish_deferred,
        "watermark_before": report.watermark_before.to_rfc3339(),
        "watermark_after": report.watermark_after.to_rfc3339(),
        "elapsed_ms": report.elapsed_ms,
        "publish": publish_json(&report.publish),
        "flush": publish_json(flush),
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to render JSON output")?;
    println!("{text}");
    Ok(())
}

async fn run_loop(config_path: Option<&Path>) -> Result<()> {
    let config = load_valid_config(config_path)?;
    let scheduler = build_scheduler(&config).await?;
    tracing::info!(command = "run", "Starting polling loop");
    let summary = scheduler.run(wait_for_shutdown_signal()).await;
    if !summary.final_flush.is_clean() {
        tracing::warn!(
            command = "run",
            failed = summary.final_flush.failed.len(),
            "Exiting with unpublished buckets"
        );
    }
    tracing::info!(command = "run", ?summary, "Polling loop stopped");
    Ok(())
}

async fn run_once(config_path: Option<&Path>) -> Result<()> {
    let config = load_valid_config(config_path)?;
    let mut scheduler = build_scheduler(&config).await?;
    tracing::info!(command = "once", "Running a single cycle");
    let report = match scheduler.tick().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(command = "once", error = %e, "Cycle failed");
            return Err(anyhow::Error::new(e));
        }
    };
    let flush = scheduler.flush().await;
    print_json(&cycle_json(&report, &flush))?;
    if !flush.is_clean() {
        anyhow::bail!("{} bucket(s) could not be published", flush.failed.len());
    }
    Ok(())
}

async fn check_table(config_path: Option<&Path>) -> Result<()> {
    let config = load_valid_config(config_path)?;
    let client = client_for(&config.store).await;
    let layout = describe_table(&client, &config.store.table_name).await?;
    let assessment = assess(
        &layout,
        &config.store.timestamp_field,
        config.store.query.as_ref(),
    );
    tracing::info!(
        command = "check-table",
        optimal = assessment.optimal,
        query_path = ?assessment.query_path,
        "Table schema assessed"
    );
    print_json(&SchemaReport { layout, assessment })
}

async fn check_drive(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let drive = drive_client(&config)?;
    let access = drive
        .check_access()
        .await
        .context("Google Drive is not accessible")?;
    tracing::info!(
        command = "check-drive",
        visible_files = access.visible_files.len(),
        "Drive access confirmed"
    );
    print_json(&access)
}

fn format_credentials(file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read credentials file {}", file.display()))?;
    let line = to_single_line(&raw)?;
    let key = ServiceAccountKey::from_json(&line)?;
    println!("{line}");
    eprintln!(
        "project_id: {}",
        key.project_id.as_deref().unwrap_or("unknown")
    );
    eprintln!("client_email: {}", key.client_email);
    Ok(())
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Run { config } => run_loop(config.as_deref()).await,
        Commands::Once { config } => run_once(config.as_deref()).await,
        Commands::Health { config } => {
            let config = load_config(config.as_deref())?;
            let report = health_check(&config, |name| std::env::var(name).ok(), Utc::now());
            tracing::info!(command = "health", status = ?report.status, "Health report built");
            print_json(&report)
        }
        Commands::CheckTable { config } => check_table(config.as_deref()).await,
        Commands::CheckDrive { config } => check_drive(config.as_deref()).await,
        Commands::Credentials { file } => format_credentials(&file),
    }
}
