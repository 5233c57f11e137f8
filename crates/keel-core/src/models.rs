//! Domain models shared by the repositories, the worker runtime and the CLI.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::tuning::RecallTarget;

/// Implements `as_str`, `Display` and `FromStr` for a unit enum stored as text.
macro_rules! text_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Text form stored in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        concat!("unknown ", $label, ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// JOBS
// =============================================================================

/// Lifecycle status of a job.
///
/// pending → processing → completed, or on failure back to pending/scheduled
/// (retry) or dead. scheduled → pending once due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Failed,
    Dead,
}

text_enum!(JobStatus, "job status", {
    Pending => "pending",
    Scheduled => "scheduled",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Dead => "dead",
});

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Scheduled,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    /// Completed and dead jobs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub pool: String,
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub result: Option<JsonValue>,
}

impl Job {
    /// Retries left before the next failure dead-letters the job.
    pub fn retries_remaining(&self) -> i32 {
        (self.max_retries - self.retry_count).max(0)
    }
}

/// Producer-side request to add a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub pool: String,
    pub job_type: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

fn default_priority() -> i32 {
    defaults::JOB_PRIORITY
}

fn default_max_retries() -> i32 {
    defaults::JOB_MAX_RETRIES
}

impl EnqueueRequest {
    pub fn new(pool: impl Into<String>, job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            pool: pool.into(),
            job_type: job_type.into(),
            payload,
            priority: defaults::JOB_PRIORITY,
            scheduled_at: None,
            max_retries: defaults::JOB_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Reject malformed requests before anything touches the database.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<()> {
        if self.pool.trim().is_empty() {
            return Err(Error::InvalidJob("pool must not be empty".into()));
        }
        if self.job_type.trim().is_empty() {
            return Err(Error::InvalidJob("job_type must not be empty".into()));
        }
        check_name("pool", &self.pool, defaults::JOB_POOL_MAX_LEN)?;
        check_name("job_type", &self.job_type, defaults::JOB_TYPE_MAX_LEN)?;
        if !(defaults::JOB_PRIORITY_MIN..=defaults::JOB_PRIORITY_MAX).contains(&self.priority) {
            return Err(Error::InvalidJob(format!(
                "priority {} outside {}..={}",
                self.priority,
                defaults::JOB_PRIORITY_MIN,
                defaults::JOB_PRIORITY_MAX
            )));
        }
        if self.max_retries < 0 {
            return Err(Error::InvalidJob(format!(
                "max_retries must be >= 0, got {}",
                self.max_retries
            )));
        }
        let size = serde_json::to_vec(&self.payload)?.len();
        if size > max_payload_bytes {
            return Err(Error::InvalidJob(format!(
                "payload is {} bytes, limit is {}",
                size, max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Initial status: scheduled when `scheduled_at` lies in the future.
    pub fn initial_status(&self, now: DateTime<Utc>) -> JobStatus {
        match self.scheduled_at {
            Some(at) if at > now => JobStatus::Scheduled,
            _ => JobStatus::Pending,
        }
    }
}

/// Reject a pool or job type that cannot travel in a notification payload.
fn check_name(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.len() > max_len {
        return Err(Error::InvalidJob(format!(
            "{} is {} bytes, limit is {}",
            field,
            value.len(),
            max_len
        )));
    }
    if value.contains('\0') {
        return Err(Error::InvalidJob(format!("{} contains a NUL character", field)));
    }
    Ok(())
}

/// Filter for job listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub pool: Option<String>,
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Queue statistics for one pool or all pools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub scheduled: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
    /// Age of the oldest pending job in seconds.
    pub oldest_pending_secs: Option<i64>,
}

impl QueueStats {
    /// Jobs not yet in a terminal state.
    pub fn active(&self) -> i64 {
        self.pending + self.scheduled + self.processing + self.failed
    }
}

/// Where a failed attempt was routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// Job goes back to the queue; `retry_at` is set when a backoff applies.
    Retrying {
        retry_count: i32,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Retry budget exhausted; the job is dead and snapshotted.
    DeadLettered {
        retry_count: i32,
        dead_letter_id: Uuid,
    },
}

// =============================================================================
// WORKERS
// =============================================================================

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    Processing,
    Stopping,
    Stopped,
    Error,
}

text_enum!(WorkerState, "worker state", {
    Starting => "starting",
    Idle => "idle",
    Processing => "processing",
    Stopping => "stopping",
    Stopped => "stopped",
    Error => "error",
});

impl WorkerState {
    /// Stopped and error workers are ignored by the heartbeat monitor.
    pub fn is_live(&self) -> bool {
        !matches!(self, WorkerState::Stopped | WorkerState::Error)
    }
}

/// A registered worker process or concurrency slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub pool: String,
    pub name: String,
    pub hostname: Option<String>,
    pub pid: Option<i32>,
    pub state: WorkerState,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub current_job: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Outcome of one stale-worker sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleWorkerSweep {
    pub workers_marked: u64,
    pub jobs_requeued: u64,
    pub jobs_dead_lettered: u64,
}

// =============================================================================
// DEAD LETTERS
// =============================================================================

/// Snapshot of a job that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub job_id: Uuid,
    pub pool: String,
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub max_retries: i32,
    pub error: Option<String>,
    pub retry_count: i32,
    pub job_created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub reprocessed_at: Option<DateTime<Utc>>,
    pub reprocessed_job_id: Option<Uuid>,
}

impl DeadLetter {
    pub fn is_reprocessed(&self) -> bool {
        self.reprocessed_job_id.is_some()
    }
}

// =============================================================================
// VECTOR STORE
// =============================================================================

/// Distance metric of a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    Dot,
}

text_enum!(DistanceMetric, "distance metric", {
    Cosine => "cosine",
    Euclidean => "euclidean",
    Dot => "dot",
});

impl DistanceMetric {
    /// pgvector distance operator.
    pub fn operator(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "<=>",
            DistanceMetric::Euclidean => "<->",
            DistanceMetric::Dot => "<#>",
        }
    }

    /// Operator class for ivfflat and hnsw indexes.
    pub fn opclass(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "vector_cosine_ops",
            DistanceMetric::Euclidean => "vector_l2_ops",
            DistanceMetric::Dot => "vector_ip_ops",
        }
    }

    /// Convert an operator distance to a higher-is-better score.
    ///
    /// `<#>` yields the negated inner product, so its score is `-d`.
    pub fn score(&self, distance: f64) -> f64 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::Euclidean => 1.0 / (1.0 + distance),
            DistanceMetric::Dot => -distance,
        }
    }
}

/// Index strategy of a collection.
///
/// `Exact` forces sequential scans so results are always exact. `None` has no
/// index yet. `Ivf` and `Graph` build ivfflat and hnsw indexes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    Exact,
    #[default]
    None,
    Ivf,
    Graph,
}

text_enum!(IndexType, "index type", {
    Exact => "exact",
    None => "none",
    Ivf => "ivf",
    Graph => "graph",
});

impl IndexType {
    pub fn is_approximate(&self) -> bool {
        matches!(self, IndexType::Ivf | IndexType::Graph)
    }

    /// pgvector access method name.
    pub fn access_method(&self) -> Option<&'static str> {
        match self {
            IndexType::Ivf => Some("ivfflat"),
            IndexType::Graph => Some("hnsw"),
            IndexType::Exact | IndexType::None => None,
        }
    }
}

/// Tuning parameters of a collection index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lists: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_construction: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<i32>,
    #[serde(default)]
    pub recall_target: RecallTarget,
}

/// Request to create a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    pub dimension: i32,
    #[serde(default)]
    pub metric: DistanceMetric,
    #[serde(default)]
    pub index_type: IndexType,
    #[serde(default)]
    pub index_config: IndexConfig,
}

impl CreateCollectionRequest {
    pub fn new(name: impl Into<String>, dimension: i32) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric: DistanceMetric::default(),
            index_type: IndexType::default(),
            index_config: IndexConfig::default(),
        }
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_index(mut self, index_type: IndexType, config: IndexConfig) -> Self {
        self.index_type = index_type;
        self.index_config = config;
        self
    }
}

/// Metadata of a named vector collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorCollection {
    pub name: String,
    pub dimension: i32,
    pub metric: DistanceMetric,
    pub index_type: IndexType,
    pub index_config: IndexConfig,
    pub row_count: i64,
    /// Row count observed by the last reindex.
    pub reindex_row_count: Option<i64>,
    pub last_reindex_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VectorCollection {
    /// Fail with `DimensionMismatch` unless `len` matches the collection.
    pub fn check_dimension(&self, len: usize) -> Result<()> {
        let expected = self.dimension as usize;
        if len != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    /// True when the row count moved by `factor` or more since the last reindex.
    pub fn has_drifted(&self, factor: f64) -> bool {
        match self.reindex_row_count {
            None => self.row_count > 0,
            Some(0) => self.row_count > 0,
            Some(base) => {
                let ratio = self.row_count as f64 / base as f64;
                ratio >= factor || ratio <= 1.0 / factor
            }
        }
    }
}

/// One embedding returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    /// Higher is better.
    pub score: f64,
    /// Raw operator distance; lower is better.
    pub distance: f64,
    pub payload: JsonValue,
}

/// A nearest-neighbor query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    #[serde(default = "default_search_limit")]
    pub k: i64,
    /// JSON containment filter on the payload.
    #[serde(default)]
    pub filter: Option<JsonValue>,
}

fn default_search_limit() -> i64 {
    defaults::SEARCH_LIMIT
}

impl SearchRequest {
    pub fn new(vector: Vec<f32>, k: i64) -> Self {
        Self {
            vector,
            k,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: JsonValue) -> Self {
        self.filter = Some(filter);
        self
    }
}

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Result of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests counted in the current window, this one included.
    pub count: i64,
    pub reset_at: DateTime<Utc>,
}
