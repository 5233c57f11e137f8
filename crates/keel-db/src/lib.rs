//! # keel-db
//!
//! PostgreSQL storage layer for keel.
//!
//! This crate provides:
//! - Connection pool management
//! - The job queue with `FOR UPDATE SKIP LOCKED` claims
//! - The worker registry and stale-worker reclaim
//! - Dead-letter storage and the retry/dead-letter routing of failures
//! - Named pgvector collections with exact, ivfflat and hnsw search
//! - Fixed-window rate limit counters
//! - LISTEN/NOTIFY delivery of queue events
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_db::{Database, EnqueueRequest, JobRepository};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/keel").await?;
//!
//!     let job_id = db
//!         .jobs
//!         .enqueue(EnqueueRequest::new("ingest", "embed_document", json!({"doc": 42})))
//!         .await?;
//!
//!     println!("Enqueued job: {}", job_id);
//!     Ok(())
//! }
//! ```
pub mod dead_letters;
pub mod jobs;
pub mod notify;
pub mod pool;
pub mod rate_limits;
pub mod validation;
pub mod vectors;
pub mod workers;

// Always compiled so integration tests (in tests/) can share the defaults.
pub mod test_fixtures;

// Re-export core types
pub use keel_core::*;

pub use dead_letters::PgDeadLetterRepository;
pub use jobs::{PgJobRepository, QueueConfig};
pub use notify::{notify, ListenerHandle, NotificationListener};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use rate_limits::{window_bounds, PgRateLimiter};
pub use validation::validate_collection_name;
pub use vectors::PgVectorRepository;
pub use workers::{PgWorkerRepository, DEREGISTERED_ERROR, HEARTBEAT_TIMEOUT_ERROR};

/// All repositories over one connection pool.
#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub jobs: PgJobRepository,
    pub workers: PgWorkerRepository,
    pub dead_letters: PgDeadLetterRepository,
    pub vectors: PgVectorRepository,
    pub rate_limits: PgRateLimiter,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self::with_queue_config(pool, QueueConfig::default())
    }

    /// Build with a custom retry policy and payload limit for the queue.
    pub fn with_queue_config(pool: sqlx::Pool<sqlx::Postgres>, queue: QueueConfig) -> Self {
        Self {
            jobs: PgJobRepository::with_config(pool.clone(), queue),
            workers: PgWorkerRepository::new(pool.clone()),
            dead_letters: PgDeadLetterRepository::new(pool.clone()),
            vectors: PgVectorRepository::new(pool.clone()),
            rate_limits: PgRateLimiter::new(pool.clone()),
            pool,
        }
    }

    /// Replace the vector index tuning.
    pub fn with_tuning(mut self, tuning: TuningConfig) -> Self {
        self.vectors = self.vectors.with_tuning(tuning);
        self
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Start a listener that forwards committed notifications to `dispatcher`.
    pub async fn listen(&self, dispatcher: Dispatcher) -> Result<ListenerHandle> {
        NotificationListener::new(self.pool.clone(), dispatcher)
            .start()
            .await
    }

    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
