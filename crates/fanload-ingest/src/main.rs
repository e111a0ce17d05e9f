//! fanload Ingest - parallel batch ingestion tool

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use fanload_common::logging::{init_logging, LogConfig, LogLevel};
use fanload_common::FileReference;
use fanload_ingest::{
    ArrivalEvent, BatchPlanner, DatabaseConfig, EstimateStore, FanoutCoordinator, InProcessLauncher, IngestConfig,
    LocalSource, MemoryStore, ObjectSource, PostgresStore, RunStatus, S3Source, StorageConfig, TriggerInitiator,
};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fanload-ingest")]
#[command(author, version, about = "Parallel batch ingestion of delimited files")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Where source objects are read from
    #[arg(long, value_enum, default_value = "s3", env = "FANLOAD_SOURCE", global = true)]
    source: SourceKind,

    /// Root directory for the local source (`<root>/<bucket>/<key>`)
    #[arg(long, default_value = "./data", env = "FANLOAD_LOCAL_ROOT", global = true)]
    local_root: PathBuf,

    /// Where parsed records are written
    #[arg(long, value_enum, default_value = "postgres", env = "FANLOAD_STORE", global = true)]
    store: StoreKind,

    /// Lines per batch (overrides FANLOAD_BATCH_SIZE)
    #[arg(long, global = true)]
    batch_size: Option<u64>,

    /// Max batches in flight (overrides FANLOAD_MAX_CONCURRENCY)
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Count lines and print the batch list as JSON
    Plan {
        #[arg(short, long)]
        bucket: String,

        #[arg(short, long)]
        key: String,
    },

    /// Ingest one file and print the run outcome as JSON
    Run {
        #[arg(short, long)]
        bucket: String,

        #[arg(short, long)]
        key: String,
    },

    /// Start one run per file in an arrival notification and wait for all
    OnEvent {
        /// Notification JSON file, or `-` for stdin
        #[arg(short, long)]
        event: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceKind {
    S3,
    Local,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreKind {
    Postgres,
    Memory,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("fanload-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::load_env().context("Invalid FANLOAD_* configuration")?;
    if let Some(batch_size) = cli.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(max_concurrency) = cli.max_concurrency {
        config = config.with_max_concurrency(Some(max_concurrency));
    }
    config.validate().context("Invalid ingest configuration")?;

    let source = open_source(cli.source, &cli.local_root).await;

    match cli.command {
        Command::Plan { bucket, key } => {
            let file = FileReference::try_new(bucket, key)?;
            let planner = BatchPlanner::new(source, config.batch_size)?;
            let plan = planner.plan_file(&file).await?;
            println!("{}", serde_json::to_string_pretty(&plan.dispatch_items())?);
        },
        Command::Run { bucket, key } => {
            let file = FileReference::try_new(bucket, key)?;
            let store = open_store(cli.store).await?;
            let coordinator = FanoutCoordinator::with_worker_pool(source, store, config)?;

            let outcome = coordinator.run(&file).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);

            if outcome.status != RunStatus::Completed {
                bail!("Run {} for {} finished {}", outcome.run_id, file.url(), outcome.status);
            }
        },
        Command::OnEvent { event } => {
            let raw = read_event(&event).await?;
            let event = ArrivalEvent::from_json(&raw)?;

            let store = open_store(cli.store).await?;
            let coordinator = FanoutCoordinator::with_worker_pool(source, store, config)?;
            let initiator = TriggerInitiator::new(InProcessLauncher::new(Arc::new(coordinator)));

            let executions = initiator.on_arrival(&event).await?;
            info!("Waiting for {} run(s)", executions.len());

            let mut incomplete = 0usize;
            let mut report = Vec::with_capacity(executions.len());
            for (execution, result) in initiator.launcher().wait_all().await {
                match result {
                    Ok(outcome) => {
                        if outcome.status != RunStatus::Completed {
                            incomplete += 1;
                        }
                        report.push(serde_json::json!({ "execution": execution, "outcome": outcome }));
                    },
                    Err(e) => {
                        incomplete += 1;
                        report.push(serde_json::json!({ "execution": execution, "error": e.to_string() }));
                    },
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);

            if incomplete > 0 {
                bail!("{} of {} run(s) did not complete", incomplete, report.len());
            }
        },
    }

    info!("Ingestion complete");
    Ok(())
}

async fn open_source(kind: SourceKind, local_root: &Path) -> Arc<dyn ObjectSource> {
    match kind {
        SourceKind::S3 => Arc::new(S3Source::new(StorageConfig::from_env()).await),
        SourceKind::Local => Arc::new(LocalSource::new(local_root)),
    }
}

async fn open_store(kind: StoreKind) -> Result<Arc<dyn EstimateStore>> {
    match kind {
        StoreKind::Postgres => {
            let db = DatabaseConfig::from_env()?;
            let store = PostgresStore::connect(&db)
                .await
                .context("Failed to connect to destination database")?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        },
        StoreKind::Memory => {
            warn!("Using in-memory store; records are discarded on exit");
            Ok(Arc::new(MemoryStore::new()))
        },
    }
}

async fn read_event(path: &Path) -> Result<String> {
    let mut raw = String::new();
    if path.as_os_str() == "-" {
        tokio::io::stdin().read_to_string(&mut raw).await?;
    } else {
        raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read event file {}", path.display()))?;
    }
    Ok(raw)
}
