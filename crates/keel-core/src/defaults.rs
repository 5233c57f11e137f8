//! Centralized default constants for keel.
//!
//! **This module is the single source of truth** for shared default values.
//! `from_env()` constructors fall back to these when a variable is unset.

// =============================================================================
// DATABASE
// =============================================================================

/// Maximum connections in the shared pool.
pub const DB_MAX_CONNECTIONS: u32 = 20;

/// Minimum idle connections kept warm.
pub const DB_MIN_CONNECTIONS: u32 = 2;

/// Connection acquire timeout.
pub const DB_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Idle connection eviction.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

/// Maximum lifetime of a pooled connection.
pub const DB_MAX_LIFETIME_SECS: u64 = 1800;

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Priority assigned when the producer does not pick one. 1 is most urgent.
pub const JOB_PRIORITY: i32 = 5;

/// Most urgent priority.
pub const JOB_PRIORITY_MIN: i32 = 1;

/// Least urgent priority.
pub const JOB_PRIORITY_MAX: i32 = 10;

/// Retry budget for new jobs.
pub const JOB_MAX_RETRIES: i32 = 3;

/// Longest pool name in bytes. Pool names travel in every notification.
pub const JOB_POOL_MAX_LEN: usize = 128;

/// Longest job type in bytes.
pub const JOB_TYPE_MAX_LEN: usize = 128;

/// Serialized payload size limit (1 MiB).
pub const JOB_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default page size for job and dead letter listings.
pub const PAGE_LIMIT: i64 = 50;

/// Completed and dead jobs older than this are purged.
pub const JOB_RETENTION_DAYS: i64 = 7;

/// Reprocessed dead letters older than this are purged.
pub const DEAD_LETTER_RETENTION_DAYS: i64 = 30;

/// Upper bound for any configured retention, about a century.
pub const RETENTION_MAX_DAYS: u64 = 36_500;

/// `last_error` text carried in a job_failed notification is cut to this
/// many bytes. pg_notify payloads are capped at 8000 bytes, and JSON
/// escaping can grow a control character to six.
pub const NOTIFY_ERROR_MAX_BYTES: usize = 1000;

// =============================================================================
// RETRY POLICY
// =============================================================================

/// First retry delay for the exponential strategy.
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Ceiling for any single retry delay.
pub const RETRY_MAX_DELAY_MS: u64 = 300_000;

// =============================================================================
// WORKERS
// =============================================================================

/// Fallback poll when no job_available notification arrives.
pub const JOB_POLL_INTERVAL_MS: u64 = 5_000;

/// Concurrency slots per worker process.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Per-job execution timeout.
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Heartbeat cadence for each worker slot.
pub const WORKER_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// A worker silent for longer than this is reclaimed.
pub const WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 120;

/// How often the heartbeat monitor sweeps.
pub const WORKER_MONITOR_INTERVAL_SECS: u64 = 30;

/// Pool used by workers and the CLI when none is configured.
pub const WORKER_POOL: &str = "default";

/// Attempts at recording a job outcome before the slot gives up its claim.
pub const JOB_SETTLE_ATTEMPTS: u32 = 3;

/// Backoff step between outcome write attempts.
pub const JOB_SETTLE_BACKOFF_MS: u64 = 200;

/// Broadcast buffer for in-process worker events.
pub const WORKER_EVENT_CAPACITY: usize = 1_000;

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Bounded queue depth per subscriber before events are dropped.
pub const SUBSCRIBER_CAPACITY: usize = 256;

// =============================================================================
// MAINTENANCE
// =============================================================================

/// Promotion of due scheduled jobs.
pub const MAINTENANCE_PROMOTE_INTERVAL_SECS: u64 = 5;

/// Expired rate-limit window purge.
pub const MAINTENANCE_RATE_LIMIT_INTERVAL_SECS: u64 = 300;

/// Completed/dead job and reprocessed dead letter purge.
pub const MAINTENANCE_CLEANUP_INTERVAL_SECS: u64 = 3_600;

/// Auto-reindex check for approximate collections.
pub const MAINTENANCE_REINDEX_INTERVAL_SECS: u64 = 3_600;

/// Row count growth or shrink factor that triggers an auto-reindex.
pub const REINDEX_DRIFT_FACTOR: f64 = 2.0;

// =============================================================================
// VECTOR STORE
// =============================================================================

/// Schema holding one table per collection.
pub const VECTOR_SCHEMA: &str = "keel_vectors";

/// Column storage limit of pgvector's `vector` type.
pub const VECTOR_MAX_DIMENSION: i32 = 16_000;

/// Index limit of pgvector's ivfflat and hnsw access methods.
pub const VECTOR_MAX_INDEXED_DIMENSION: i32 = 2_000;

/// Longest collection name; index names append a suffix to it.
pub const COLLECTION_NAME_MAX_LEN: usize = 48;

/// Default `k` for searches.
pub const SEARCH_LIMIT: i64 = 10;

/// Rows per ivf list up to the large-corpus threshold.
pub const IVF_ROWS_PER_LIST: i64 = 1_000;

/// Above this row count ivf lists grow with sqrt(rows).
pub const IVF_LARGE_CORPUS_ROWS: i64 = 1_000_000;

/// Minimum rows before an approximate index is worth building.
pub const REINDEX_MIN_ROWS: i64 = 1_000;

/// pgvector's default hnsw graph degree.
pub const GRAPH_M: i32 = 16;

/// pgvector's default hnsw build breadth.
pub const GRAPH_EF_CONSTRUCTION: i32 = 64;

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Requests per window for callers without an explicit limit.
pub const RATE_LIMIT_REQUESTS: i64 = 100;

/// Window length in seconds.
pub const RATE_LIMIT_WINDOW_SECS: i64 = 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_default_within_bounds() {
        assert!((JOB_PRIORITY_MIN..=JOB_PRIORITY_MAX).contains(&JOB_PRIORITY));
    }

    #[test]
    fn heartbeat_timeout_exceeds_interval() {
        // Several missed beats must elapse before reclaim.
        assert!(WORKER_HEARTBEAT_TIMEOUT_SECS >= 3 * WORKER_HEARTBEAT_INTERVAL_SECS);
    }

    #[test]
    fn retry_delays_ordered() {
        assert!(RETRY_BASE_DELAY_MS <= RETRY_MAX_DELAY_MS);
    }

    #[test]
    fn indexed_dimension_within_storage_limit() {
        assert!(VECTOR_MAX_INDEXED_DIMENSION <= VECTOR_MAX_DIMENSION);
    }

    #[test]
    fn collection_name_leaves_room_for_index_suffix() {
        assert!(COLLECTION_NAME_MAX_LEN + "_ann_next".len() <= 63);
    }
}
