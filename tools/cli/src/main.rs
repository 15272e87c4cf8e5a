//! FitSync CLI - Command line front end for the offline-first sync engine.
//!
//! Local edits are written to the local database and queued; `sync` pushes
//! the queue to the remote directory and pulls remote changes back, and
//! `daemon` keeps doing so on the background job schedule.

mod config;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fitsync_background::{
    BackgroundScheduler, FnJob, JobClass, MaintenanceJob, SyncJob, TokioOsScheduler,
};
use fitsync_common::{EntityType, PendingOperation, Record, RecordId};
use fitsync_storage::{DirectoryRemoteStore, LocalStore, RecordQuery, SqliteStore};
use fitsync_sync::{SyncCoordinator, SyncMode, SyncOutcome, SyncReport, SyncStatus};

use crate::config::CliConfig;

const DATABASE_FILE: &str = "fitsync.db";
const STATUS_FILE: &str = "status.json";

#[derive(Parser)]
#[command(name = "fitsync")]
#[command(about = "FitSync - Offline-first record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: <config dir>/fitsync/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a record locally and queue it for upload.
    Enqueue {
        /// Entity type, e.g. "goal".
        #[arg(short = 't', long = "type")]
        entity_type: String,

        /// Record id (generated if omitted).
        #[arg(short, long)]
        id: Option<String>,

        /// Field assignment `name=value`; values are parsed as JSON, else kept as text.
        #[arg(short, long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,

        /// Update only the given fields of an existing local record.
        #[arg(short, long)]
        modify: bool,
    },

    /// Delete a record locally and queue the remote deletion.
    Delete {
        #[arg(short = 't', long = "type")]
        entity_type: String,

        #[arg(short, long)]
        id: String,
    },

    /// List queued operations.
    Queue {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run one sync pass.
    Sync {
        /// Refetch everything instead of changes since the last pass.
        #[arg(long)]
        full: bool,
    },

    /// Show the last sync status and queue size.
    Status,

    /// Keep syncing on the background job schedule until interrupted.
    Daemon,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Status snapshot persisted between invocations.
#[derive(Debug, Serialize, Deserialize)]
struct StatusFile {
    status: SyncStatus,
    updated_at: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "fitsync", &mut std::io::stdout());
        return Ok(());
    }

    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enqueue {
            entity_type,
            id,
            fields,
            modify,
        } => cmd_enqueue(&config, &entity_type, id, &fields, modify).await,

        Commands::Delete { entity_type, id } => cmd_delete(&config, &entity_type, &id).await,

        Commands::Queue { json } => cmd_queue(&config, json).await,

        Commands::Sync { full } => {
            let mode = if full {
                SyncMode::Full
            } else {
                SyncMode::Incremental
            };
            cmd_sync(&config, mode).await
        }

        Commands::Status => cmd_status(&config).await,

        Commands::Daemon => cmd_daemon(&config).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Opened stores and the coordinator over them.
struct Engine {
    coordinator: Arc<SyncCoordinator>,
    local: Arc<SqliteStore>,
    data_dir: PathBuf,
}

async fn open_engine(config: &CliConfig) -> Result<Engine> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let remote_dir = config.remote_dir()?;
    let remote = Arc::new(
        DirectoryRemoteStore::new(&remote_dir)
            .with_context(|| format!("Failed to open remote directory {}", remote_dir.display()))?,
    );
    let local = Arc::new(
        SqliteStore::open(data_dir.join(DATABASE_FILE)).context("Failed to open local database")?,
    );

    let coordinator = SyncCoordinator::open(
        config.sync.clone(),
        remote,
        local.clone(),
        local.clone(),
        local.clone(),
    )
    .await
    .context("Failed to restore the operation queue")?;

    Ok(Engine {
        coordinator: Arc::new(coordinator),
        local,
        data_dir,
    })
}

/// Split `name=value`, parsing the value as JSON when possible.
fn parse_field(raw: &str) -> Result<(String, serde_json::Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("Field must look like name=value: {}", raw))?;
    if name.is_empty() {
        anyhow::bail!("Field name is empty: {}", raw);
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

async fn cmd_enqueue(
    config: &CliConfig,
    entity_type: &str,
    id: Option<String>,
    fields: &[String],
    modify: bool,
) -> Result<()> {
    let entity_type = EntityType::new(entity_type)?;
    let fields = fields
        .iter()
        .map(|raw| parse_field(raw))
        .collect::<Result<Vec<_>>>()?;
    if fields.is_empty() {
        anyhow::bail!("At least one --field is required");
    }

    let engine = open_engine(config).await?;

    let operation = if modify {
        let id = RecordId::new(id.context("--modify needs --id")?)?;
        let mut record = engine
            .local
            .query(&RecordQuery::by_ids(entity_type.clone(), [id.clone()]))
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("No local record {}/{}", entity_type, id))?;
        for (name, value) in fields {
            record.set_field(name, value);
        }
        engine.local.upsert(vec![record.clone()]).await?;
        PendingOperation::modify(record)
    } else {
        let id = match id {
            Some(id) => RecordId::new(id)?,
            None => RecordId::generate(),
        };
        let record = fields
            .into_iter()
            .fold(Record::new(entity_type, id), |record, (name, value)| {
                record.with_field(name, value)
            });
        engine.local.upsert(vec![record.clone()]).await?;
        PendingOperation::save(record)
    };

    let label = operation.label();
    let operation_id = operation.id.clone();
    engine
        .coordinator
        .enqueue(operation)
        .await
        .context("Failed to queue operation")?;

    println!("Queued {} ({})", label, operation_id);
    Ok(())
}

async fn cmd_delete(config: &CliConfig, entity_type: &str, id: &str) -> Result<()> {
    let entity_type = EntityType::new(entity_type)?;
    let id = RecordId::new(id)?;
    let engine = open_engine(config).await?;

    engine
        .local
        .delete(&entity_type, std::slice::from_ref(&id))
        .await?;
    let operation = PendingOperation::delete(entity_type, id);
    let label = operation.label();
    engine
        .coordinator
        .enqueue(operation)
        .await
        .context("Failed to queue operation")?;

    println!("Queued {}", label);
    Ok(())
}

async fn cmd_queue(config: &CliConfig, json: bool) -> Result<()> {
    let engine = open_engine(config).await?;
    let operations = engine.coordinator.queue().operations().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&operations)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    println!("{:<38} {:<25} OPERATION", "ID", "ENQUEUED");
    for op in &operations {
        println!(
            "{:<38} {:<25} {}",
            op.id,
            op.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            op.label()
        );
    }
    println!("\nTotal: {} operations", operations.len());
    Ok(())
}

async fn cmd_sync(config: &CliConfig, mode: SyncMode) -> Result<()> {
    let engine = open_engine(config).await?;

    let outcome = match mode {
        SyncMode::Full => engine.coordinator.sync_full().await,
        SyncMode::Incremental => engine.coordinator.sync_incremental().await,
    };
    write_status(&engine.data_dir, &engine.coordinator.status())?;

    match outcome {
        SyncOutcome::Completed(report) => {
            print_report(&report);
            Ok(())
        }
        SyncOutcome::Failed(failure) => Err(anyhow::anyhow!("Sync failed: {}", failure)),
        SyncOutcome::AlreadyRunning => {
            println!("A sync pass is already running");
            Ok(())
        }
    }
}

fn print_report(report: &SyncReport) {
    let elapsed = report.finished_at - report.started_at;
    println!("Sync ({}) completed in {} ms", report.mode, elapsed.num_milliseconds());
    println!("  Uploaded:  {}", report.drain.applied);
    println!("  Fetched:   {}", report.fetched);
    println!("  Updated:   {}", report.upserted);
    println!("  Deleted:   {}", report.deleted);
    if report.preserved > 0 {
        println!("  Kept (queued locally): {}", report.preserved);
    }
    if report.drain.left_queued() > 0 {
        println!("  Still queued: {}", report.drain.left_queued());
    }
    for eviction in &report.drain.evicted {
        println!("  Dropped {}: {}", eviction.label, eviction.reason);
    }
}

async fn cmd_status(config: &CliConfig) -> Result<()> {
    let engine = open_engine(config).await?;
    let queued = engine.coordinator.queue().len().await;

    match read_status(&engine.data_dir)? {
        Some(saved) => {
            println!("State:     {}", saved.status.state);
            match saved.status.last_sync_at {
                Some(at) => println!("Last sync: {}", at.to_rfc3339()),
                None => println!("Last sync: never"),
            }
            println!("Updated:   {}", saved.updated_at.to_rfc3339());
        }
        None => println!("State:     never synced"),
    }
    println!("Queued:    {}", queued);
    Ok(())
}

fn status_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STATUS_FILE)
}

fn write_status(data_dir: &Path, status: &SyncStatus) -> Result<()> {
    let saved = StatusFile {
        status: status.clone(),
        updated_at: Utc::now(),
    };
    let json = serde_json::to_string_pretty(&saved)?;
    std::fs::write(status_path(data_dir), json).context("Failed to write status file")?;
    Ok(())
}

fn read_status(data_dir: &Path) -> Result<Option<StatusFile>> {
    let path = status_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path).context("Failed to read status file")?;
    let saved = serde_json::from_str(&raw).context("Invalid status file")?;
    Ok(Some(saved))
}

async fn cmd_daemon(config: &CliConfig) -> Result<()> {
    let engine = open_engine(config).await?;
    let coordinator = engine.coordinator.clone();

    // Persist every status change for `fitsync status`.
    let mut status_rx = coordinator.subscribe();
    let data_dir = engine.data_dir.clone();
    let status_writer = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if let Err(e) = write_status(&data_dir, &status) {
                warn!("{:#}", e);
            }
        }
    });

    let (triggers, trigger_loop) =
        fitsync_sync::triggers::channel(config.sync.periodic_interval, true);
    let trigger_task = tokio::spawn(trigger_loop.run(coordinator.clone()));

    let os = Arc::new(TokioOsScheduler::new());
    let mut scheduler = BackgroundScheduler::new(os.clone());
    scheduler.register(
        JobClass::Sync,
        config.policy_for(JobClass::Sync),
        Arc::new(SyncJob::incremental(coordinator.clone())),
    )?;
    scheduler.register(
        JobClass::DataSync,
        config.policy_for(JobClass::DataSync),
        Arc::new(SyncJob::full(coordinator.clone())),
    )?;
    scheduler.register(
        JobClass::Maintenance,
        config.policy_for(JobClass::Maintenance),
        Arc::new(MaintenanceJob::new(coordinator.clone())),
    )?;
    let queue_watch = coordinator.clone();
    scheduler.register(
        JobClass::NotificationRefresh,
        config.policy_for(JobClass::NotificationRefresh),
        Arc::new(FnJob::new(move |_cancel| {
            let coordinator = queue_watch.clone();
            async move {
                let queued = coordinator.queue().len().await;
                if queued > 0 {
                    info!("{} local changes waiting to sync", queued);
                }
                Ok(())
            }
        })),
    )?;
    scheduler.schedule_all();

    for (job_id, scheduled) in scheduler.job_status() {
        if !scheduled {
            warn!("Background job {} could not be scheduled", job_id);
        }
    }

    triggers.foreground().await?;
    info!("Daemon running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    scheduler.cancel_all();
    triggers.shutdown().await;
    if let Err(e) = trigger_task.await {
        warn!("Trigger loop ended abnormally: {}", e);
    }
    status_writer.abort();
    write_status(&engine.data_dir, &coordinator.status())?;
    Ok(())
}
