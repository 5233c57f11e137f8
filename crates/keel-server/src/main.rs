//! keel: command-line entry point.
//!
//! Runs migrations, the background maintenance service (notification
//! listener, stale-worker sweep, promotion, purges and auto-reindex), and a
//! few inspection and repair commands against the same database.

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use keel_core::{tuning, uuid_utils};
use keel_db::{create_pool_with_config, log_pool_metrics, Database, PoolConfig, QueueConfig};
use keel_jobs::{
    handler_fn, DeadLetterRepository, Dispatcher, EnqueueRequest, EventKind,
    JobRepository, MaintenanceConfig, MaintenanceContext, MaintenanceScheduler, MaintenanceTask,
    RecallTarget, VectorRepository, WorkerRepository,
};

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/keel";

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "PostgreSQL job queue, pub/sub bus, rate limiter and vector store")]
#[command(propagate_version = true)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL, global = true)]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Run the listener and maintenance tasks until Ctrl-C
    Serve {
        /// Apply migrations before starting
        #[arg(long)]
        migrate: bool,
    },

    /// Show queue counts and registered workers
    Stats {
        /// Restrict to one pool
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// Inspect or reprocess dead letters
    DeadLetters {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },

    /// Enqueue one job
    Enqueue {
        #[arg(short, long, default_value = keel_core::defaults::WORKER_POOL)]
        pool: String,

        #[arg(short, long)]
        job_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// 1 (most urgent) to 10
        #[arg(long, default_value_t = keel_core::defaults::JOB_PRIORITY)]
        priority: i32,

        #[arg(long, default_value_t = keel_core::defaults::JOB_MAX_RETRIES)]
        max_retries: i32,

        /// Schedule the job this many seconds in the future
        #[arg(long)]
        delay_secs: Option<i64>,
    },

    /// Run one maintenance task once
    Maintenance {
        /// promote-due, stale-workers, rate-limits, old-jobs, dead-letters or reindex
        task: String,
    },

    /// List vector collections with their index tuning
    Collections,

    /// Rebuild the index of one vector collection
    Reindex {
        collection: String,

        /// fast, balanced, high or exhaustive
        #[arg(long)]
        recall: Option<String>,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// List the most recent dead letters
    List {
        #[arg(short, long)]
        pool: Option<String>,

        #[arg(short, long, default_value_t = keel_core::defaults::PAGE_LIMIT)]
        limit: i64,
    },

    /// Enqueue a fresh job from a dead letter
    Reprocess { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _file_guard = init_tracing();
    let cli = Cli::parse();

    let pool = create_pool_with_config(&cli.database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;
    let db = Database::with_queue_config(pool, QueueConfig::from_env());

    match cli.command {
        Commands::Migrate => {
            db.migrate().await.context("migration failed")?;
            info!("Migrations applied");
        }
        Commands::Serve { migrate } => {
            if migrate {
                db.migrate().await.context("migration failed")?;
            }
            serve(db).await?;
        }
        Commands::Stats { pool } => cmd_stats(&db, pool.as_deref()).await?,
        Commands::DeadLetters { command } => match command {
            DeadLetterCommands::List { pool, limit } => {
                cmd_dead_letters(&db, pool.as_deref(), limit).await?
            }
            DeadLetterCommands::Reprocess { id } => {
                let job_id = db.dead_letters.reprocess(id).await?;
                println!("Reprocessed dead letter {} as job {}", id, job_id);
            }
        },
        Commands::Enqueue {
            pool,
            job_type,
            payload,
            priority,
            max_retries,
            delay_secs,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut request = EnqueueRequest::new(pool, job_type, payload)
                .with_priority(priority)
                .with_max_retries(max_retries);
            if let Some(secs) = delay_secs {
                request = request.scheduled_at(chrono::Utc::now() + chrono::Duration::seconds(secs));
            }
            let job_id = db.jobs.enqueue(request).await?;
            match uuid_utils::created_at(&job_id) {
                Some(at) => println!("Enqueued job {} at {}", job_id, at.to_rfc3339()),
                None => println!("Enqueued job {}", job_id),
            }
        }
        Commands::Maintenance { task } => {
            let task: MaintenanceTask = task.parse()?;
            let scheduler = MaintenanceScheduler::new(
                MaintenanceContext::from(&db),
                MaintenanceConfig::from_env(),
            );
            let affected = scheduler.run_task(task).await?;
            println!("{}: {} affected", task, affected);
        }
        Commands::Collections => cmd_collections(&db).await?,
        Commands::Reindex { collection, recall } => {
            let recall = recall.map(|r| r.parse::<RecallTarget>()).transpose()?;
            let config = db.vectors.reindex(&collection, recall).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "keel=info,keel_db=info,keel_jobs=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "keel=info,keel_db=info,keel_jobs=info,keel_core=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("keel.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Listener plus maintenance until Ctrl-C.
async fn serve(db: Database) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::default();
    for kind in EventKind::ALL {
        dispatcher.subscribe(
            kind,
            handler_fn(|event| async move {
                debug!(
                    subsystem = "server",
                    event_kind = %event.kind(),
                    pool = %event.pool(),
                    event = ?event,
                    "Notification"
                );
                Ok(())
            }),
        );
    }
    let listener = db.listen(dispatcher).await?;

    let config = MaintenanceConfig::from_env();
    info!(
        subsystem = "server",
        monitor_interval_secs = config.monitor.interval_secs,
        heartbeat_timeout_secs = config.monitor.timeout_secs,
        "Starting maintenance service"
    );
    let maintenance = MaintenanceScheduler::new(MaintenanceContext::from(&db), config).start();
    log_pool_metrics(db.pool());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!(subsystem = "server", "Shutdown requested");

    maintenance.shutdown().await?;
    listener.shutdown().await?;
    log_pool_metrics(db.pool());
    info!(subsystem = "server", "Stopped");
    Ok(())
}

async fn cmd_stats(db: &Database, pool: Option<&str>) -> anyhow::Result<()> {
    let stats = db.jobs.queue_stats(pool).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let dead = db.dead_letters.count(pool).await?;
    println!("dead letters: {}", dead);

    let workers = db.workers.list(pool).await?;
    println!("workers: {}", workers.len());
    for worker in workers {
        println!(
            "  {}  {:<20} {:<12} {:<10} done={} failed={} job={} heartbeat={}",
            worker.id,
            worker.name,
            worker.pool,
            worker.state.as_str(),
            worker.jobs_completed,
            worker.jobs_failed,
            worker
                .current_job
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            worker.last_heartbeat.to_rfc3339(),
        );
    }
    Ok(())
}

async fn cmd_dead_letters(db: &Database, pool: Option<&str>, limit: i64) -> anyhow::Result<()> {
    let letters = db.dead_letters.list(pool, limit).await?;
    if letters.is_empty() {
        println!("No dead letters");
        return Ok(());
    }
    for letter in letters {
        let status = match letter.reprocessed_job_id {
            Some(job_id) => format!("reprocessed as {}", job_id),
            None => "pending review".to_string(),
        };
        println!(
            "{}  {:<12} {:<20} retries={} failed_at={}  {}\n    error: {}",
            letter.id,
            letter.pool,
            letter.job_type,
            letter.retry_count,
            letter.failed_at.to_rfc3339(),
            status,
            letter.error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn cmd_collections(db: &Database) -> anyhow::Result<()> {
    let collections = db.vectors.list_collections().await?;
    if collections.is_empty() {
        println!("No collections");
        return Ok(());
    }
    for c in collections {
        let recall = tuning::estimated_recall_for(c.index_type, &c.index_config)
            .map(|r| format!("{:.0}%", r * 100.0))
            .unwrap_or_else(|| "exact".to_string());
        println!(
            "{:<32} dim={:<5} {:<9} {:<5} rows={:<8} recall~{} last_reindex={}",
            c.name,
            c.dimension,
            c.metric.as_str(),
            c.index_type.as_str(),
            c.row_count,
            recall,
            c.last_reindex_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(())
}
