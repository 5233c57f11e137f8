//! Structured logging schema and field name constants for keel.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation tools can query the queue, the registry, the dispatcher
//! and the vector store by the same field names.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue (dropped event, stale claim, reclaimed worker) |
//! | INFO  | Lifecycle events (startup, shutdown), maintenance outcomes |
//! | DEBUG | Decision points, claims, retry routing, tuning choices |
//! | TRACE | Per-notification and per-row detail |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs", "dispatcher", "server"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "queue", "registry", "listener", "monitor", "maintenance"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "enqueue", "claim", "fail", "reclaim", "reindex", "check"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being operated on.
pub const JOB_ID: &str = "job_id";

/// Opaque job type string.
pub const JOB_TYPE: &str = "job_type";

/// Worker pool name.
pub const POOL: &str = "pool";

/// Worker UUID.
pub const WORKER_ID: &str = "worker_id";

/// Dead letter UUID.
pub const DEAD_LETTER_ID: &str = "dead_letter_id";

/// Vector collection name.
pub const COLLECTION: &str = "collection";

/// Notification channel / event kind.
pub const EVENT_KIND: &str = "event_kind";

/// Rate limit key.
pub const RATE_LIMIT_KEY: &str = "rate_limit_key";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of rows touched by a maintenance or cleanup statement.
pub const ROWS_AFFECTED: &str = "rows_affected";

/// Number of results returned by a search.
pub const RESULT_COUNT: &str = "result_count";

/// Retry attempt number after increment.
pub const RETRY_COUNT: &str = "retry_count";

/// Number of live subscribers an event was delivered to.
pub const SUBSCRIBER_COUNT: &str = "subscriber_count";
