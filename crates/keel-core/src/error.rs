//! Error types for keel.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using keel's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for keel operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Enqueue request rejected before anything was persisted
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// complete/fail for a job no longer owned by the calling worker
    #[error("Stale claim: job {job_id} is not processing under worker {worker_id}")]
    StaleClaim { job_id: Uuid, worker_id: Uuid },

    /// Worker is unknown, stopped, in error, or already holding a job
    #[error("Worker not active: {0}")]
    WorkerNotActive(Uuid),

    /// Vector length does not match the collection dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector collection does not exist
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Vector collection name already taken
    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    /// Another session holds the reindex lock for this collection
    #[error("Reindex already in progress for collection: {0}")]
    ReindexInProgress(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors a caller may retry as-is (lock contention, pool exhaustion).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ReindexInProgress(_) => true,
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            Error::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
