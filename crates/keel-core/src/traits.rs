//! Repository traits implemented by `keel-db`.
//!
//! The worker runtime and maintenance services depend on these traits rather
//! than on concrete PostgreSQL types.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;
use crate::tuning::RecallTarget;

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Durable job queue with exclusive claims.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Validate and insert a job. Fires `job_available` when it is pending.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid>;

    /// Atomically claim the most urgent eligible job in `pool` for `worker_id`.
    async fn claim(&self, pool: &str, worker_id: Uuid) -> Result<Option<Job>>;

    /// Mark a job completed. `StaleClaim` unless `worker_id` still owns it.
    async fn complete(&self, job_id: Uuid, worker_id: Uuid, result: Option<JsonValue>)
        -> Result<()>;

    /// Record a failed attempt and route it to retry or the dead-letter store.
    async fn fail(&self, job_id: Uuid, worker_id: Uuid, error: &str) -> Result<FailOutcome>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List jobs matching a filter, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Counts per status for one pool, or all pools.
    async fn queue_stats(&self, pool: Option<&str>) -> Result<QueueStats>;

    /// Claimable jobs in `pool` right now.
    async fn pending_count(&self, pool: &str) -> Result<i64>;

    /// Move due scheduled jobs to pending. Returns the number promoted.
    async fn promote_due(&self) -> Result<u64>;

    /// Delete completed and dead jobs finished before `now - retention`.
    async fn cleanup_old_jobs(&self, retention: Duration) -> Result<u64>;
}

// =============================================================================
// WORKER REGISTRY
// =============================================================================

/// Live worker tracking.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Register a worker in state `starting`.
    async fn register(&self, pool: &str, name: &str) -> Result<Uuid>;

    /// Refresh `last_heartbeat` and report the current state.
    async fn heartbeat(&self, worker_id: Uuid, state: WorkerState) -> Result<()>;

    /// Release any held job and mark the worker stopped.
    async fn deregister(&self, worker_id: Uuid) -> Result<()>;

    async fn get(&self, worker_id: Uuid) -> Result<Option<Worker>>;

    async fn list(&self, pool: Option<&str>) -> Result<Vec<Worker>>;

    /// Reclaim jobs held by workers silent for longer than `timeout`.
    async fn cleanup_stale_workers(&self, timeout: Duration) -> Result<StaleWorkerSweep>;
}

// =============================================================================
// DEAD LETTERS
// =============================================================================

/// Terminal store for jobs that exhausted their retries.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn list(&self, pool: Option<&str>, limit: i64) -> Result<Vec<DeadLetter>>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>>;

    async fn count(&self, pool: Option<&str>) -> Result<i64>;

    /// Enqueue a fresh job from the snapshot. Returns the new job id.
    async fn reprocess(&self, id: Uuid) -> Result<Uuid>;

    /// Delete reprocessed dead letters older than `retention`.
    async fn purge_reprocessed(&self, retention: Duration) -> Result<u64>;
}

// =============================================================================
// VECTOR STORE
// =============================================================================

/// Named vector collections with exact or approximate search.
#[async_trait]
pub trait VectorRepository: Send + Sync {
    async fn create_collection(&self, request: CreateCollectionRequest)
        -> Result<VectorCollection>;

    /// Drop a collection and all of its embeddings.
    async fn drop_collection(&self, name: &str) -> Result<()>;

    async fn get_collection(&self, name: &str) -> Result<Option<VectorCollection>>;

    async fn list_collections(&self) -> Result<Vec<VectorCollection>>;

    /// Insert or replace one embedding.
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        payload: JsonValue,
    ) -> Result<()>;

    /// Delete one embedding. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Nearest neighbors, best first.
    async fn search(&self, collection: &str, request: &SearchRequest)
        -> Result<Vec<SearchResult>>;

    async fn count(&self, collection: &str) -> Result<i64>;

    /// Rebuild the collection index from its current row count.
    async fn reindex(
        &self,
        collection: &str,
        recall_target: Option<RecallTarget>,
    ) -> Result<IndexConfig>;
}

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Fixed-window request counters.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request for `key` and decide whether it is allowed.
    async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window_seconds: i64,
    ) -> Result<RateLimitDecision>;

    /// Delete expired windows.
    async fn cleanup_expired(&self) -> Result<u64>;
}
