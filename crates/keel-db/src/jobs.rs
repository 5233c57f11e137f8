//! Job repository implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use keel_core::{
    defaults, new_v7, EnqueueRequest, Error, Event, FailOutcome, Job, JobAvailable, JobCompleted,
    JobFilter, JobRepository, JobStatus, QueueStats, Result, RetryPolicy, WorkerState,
};

use crate::dead_letters::{lock_owned_job, route_failure};
use crate::notify::notify;

pub(crate) const JOB_COLUMNS: &str = "id, pool, job_type, payload, priority, status, created_at, \
     scheduled_at, started_at, completed_at, worker_id, retry_count, max_retries, last_error, result";

/// Queue behavior shared by every repository handle.
///
/// ## Environment Variables
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `JOB_MAX_PAYLOAD_BYTES` | `1048576` | Serialized payload limit |
/// | `RETRY_*` | see [`RetryPolicy::from_env`] | Backoff for failed attempts |
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_payload_bytes: defaults::JOB_MAX_PAYLOAD_BYTES,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let max_payload_bytes = std::env::var("JOB_MAX_PAYLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_PAYLOAD_BYTES);

        Self {
            retry: RetryPolicy::from_env(),
            max_payload_bytes,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }
}

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
    config: QueueConfig,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with default queue behavior.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self::with_config(pool, QueueConfig::default())
    }

    pub fn with_config(pool: Pool<Postgres>, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn parse_job_row(row: &PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        Ok(Job {
            id: row.try_get("id")?,
            pool: row.try_get("pool")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            worker_id: row.try_get("worker_id")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
        })
    }
}

/// Row-lock the worker before touching its job; every writer locks worker
/// rows before job rows.
async fn lock_worker(tx: &mut sqlx::Transaction<'_, Postgres>, worker_id: Uuid) -> Result<()> {
    sqlx::query("SELECT 1 FROM workers WHERE id = $1 FOR UPDATE")
        .bind(worker_id)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
    Ok(())
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid> {
        request.validate(self.config.max_payload_bytes)?;

        let job_id = new_v7();
        let status = request.initial_status(chrono::Utc::now());

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO jobs (id, pool, job_type, payload, priority, status, scheduled_at, max_retries)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(job_id)
        .bind(&request.pool)
        .bind(&request.job_type)
        .bind(&request.payload)
        .bind(request.priority)
        .bind(status.as_str())
        .bind(request.scheduled_at)
        .bind(request.max_retries)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if status == JobStatus::Pending {
            notify(
                &mut *tx,
                &Event::JobAvailable(JobAvailable {
                    pool: request.pool.clone(),
                    job_id,
                    priority: request.priority,
                    job_type: request.job_type.clone(),
                }),
            )
            .await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "queue",
            op = "enqueue",
            job_id = %job_id,
            pool = %request.pool,
            job_type = %request.job_type,
            priority = request.priority,
            status = %status,
            "Job enqueued"
        );
        Ok(job_id)
    }

    async fn claim(&self, pool: &str, worker_id: Uuid) -> Result<Option<Job>> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Lock the worker first so a concurrent reclaim or deregister cannot
        // interleave with the ownership hand-off.
        let worker: Option<(String, Option<Uuid>)> =
            sqlx::query_as("SELECT state, current_job FROM workers WHERE id = $1 FOR UPDATE")
                .bind(worker_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;

        match worker {
            Some((state, None)) if state.parse::<WorkerState>()?.is_live() => {}
            _ => return Err(Error::WorkerNotActive(worker_id)),
        }

        // Concurrent claimers skip rows locked by each other instead of waiting.
        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET status = 'processing', worker_id = $2, started_at = NOW()
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE pool = $1
                   AND (status = 'pending' OR (status = 'scheduled' AND scheduled_at <= NOW()))
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(pool)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = Self::parse_job_row(&row)?;

        sqlx::query(
            "UPDATE workers
             SET current_job = $2, state = 'processing', last_heartbeat = NOW()
             WHERE id = $1",
        )
        .bind(worker_id)
        .bind(job.id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "queue",
            op = "claim",
            job_id = %job.id,
            worker_id = %worker_id,
            pool = %pool,
            job_type = %job.job_type,
            priority = job.priority,
            retry_count = job.retry_count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Job claimed"
        );
        Ok(Some(job))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        result: Option<JsonValue>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_worker(&mut tx, worker_id).await?;

        let row: Option<(String, String)> = sqlx::query_as(
            "UPDATE jobs
             SET status = 'completed', completed_at = NOW(), result = $3, worker_id = NULL
             WHERE id = $1 AND status = 'processing' AND worker_id = $2
             RETURNING pool, job_type",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(&result)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some((pool, job_type)) = row else {
            return Err(Error::StaleClaim { job_id, worker_id });
        };

        sqlx::query(
            "UPDATE workers
             SET current_job = NULL,
                 state = CASE WHEN state = 'processing' THEN 'idle' ELSE state END,
                 jobs_completed = jobs_completed + 1,
                 last_heartbeat = NOW()
             WHERE id = $1 AND current_job = $2",
        )
        .bind(worker_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        notify(
            &mut *tx,
            &Event::JobCompleted(JobCompleted {
                job_id,
                pool: pool.clone(),
                worker_id,
                job_type: job_type.clone(),
            }),
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "queue",
            op = "complete",
            job_id = %job_id,
            worker_id = %worker_id,
            pool = %pool,
            job_type = %job_type,
            "Job completed"
        );
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, worker_id: Uuid, error: &str) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_worker(&mut tx, worker_id).await?;

        let job = lock_owned_job(&mut *tx, job_id, worker_id)
            .await?
            .ok_or(Error::StaleClaim { job_id, worker_id })?;

        let outcome = route_failure(&mut *tx, &job, error, &self.config.retry).await?;

        sqlx::query(
            "UPDATE workers
             SET current_job = NULL,
                 state = CASE WHEN state = 'processing' THEN 'idle' ELSE state END,
                 jobs_failed = jobs_failed + 1,
                 last_heartbeat = NOW()
             WHERE id = $1 AND current_job = $2",
        )
        .bind(worker_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(outcome)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR pool = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR job_type = $3)
             ORDER BY created_at DESC
             LIMIT $4 OFFSET $5"
        ))
        .bind(filter.pool.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.as_deref())
        .bind(filter.limit.unwrap_or(defaults::PAGE_LIMIT).max(1))
        .bind(filter.offset.unwrap_or(0).max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_job_row).collect()
    }

    async fn queue_stats(&self, pool: Option<&str>) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'scheduled') AS scheduled,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'dead') AS dead,
                EXTRACT(EPOCH FROM NOW() - MIN(created_at) FILTER (WHERE status = 'pending'))::bigint
                    AS oldest_pending_secs
             FROM jobs
             WHERE ($1::text IS NULL OR pool = $1)",
        )
        .bind(pool)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            scheduled: row.try_get("scheduled")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            dead: row.try_get("dead")?,
            oldest_pending_secs: row.try_get("oldest_pending_secs")?,
        })
    }

    async fn pending_count(&self, pool: &str) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs
             WHERE pool = $1
               AND (status = 'pending' OR (status = 'scheduled' AND scheduled_at <= NOW()))",
        )
        .bind(pool)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn promote_due(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let promoted: Vec<(Uuid, String, i32, String)> = sqlx::query_as(
            "UPDATE jobs
             SET status = 'pending'
             WHERE id IN (
                 SELECT id FROM jobs
                 WHERE status = 'scheduled' AND scheduled_at <= NOW()
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, pool, priority, job_type",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for (job_id, pool, priority, job_type) in &promoted {
            notify(
                &mut *tx,
                &Event::JobAvailable(JobAvailable {
                    pool: pool.clone(),
                    job_id: *job_id,
                    priority: *priority,
                    job_type: job_type.clone(),
                }),
            )
            .await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        if !promoted.is_empty() {
            debug!(
                subsystem = "db",
                component = "queue",
                op = "promote_due",
                rows_affected = promoted.len(),
                "Promoted due scheduled jobs"
            );
        }
        Ok(promoted.len() as u64)
    }

    async fn cleanup_old_jobs(&self, retention: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'dead')
               AND completed_at < NOW() - make_interval(secs => $1)",
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(
                subsystem = "db",
                component = "queue",
                op = "cleanup_old_jobs",
                rows_affected = deleted,
                retention_secs = retention.as_secs(),
                "Purged finished jobs"
            );
        }
        Ok(deleted)
    }
}
