//! Dead-letter repository and the shared retry-or-dead-letter routing.
//!
//! Both `fail` and the heartbeat reclaim end up in [`route_failure`], which
//! runs inside the caller's transaction: the job row update, the dead-letter
//! snapshot and the notifications commit or roll back together.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use keel_core::events::{strip_nul, truncate_error};
use keel_core::{
    defaults, new_v7, DeadLetter, DeadLetterRepository, Error, Event, FailOutcome, JobAvailable,
    JobFailed, Result, RetryDecision, RetryPolicy,
};

use crate::notify::notify;

const DEAD_LETTER_COLUMNS: &str = "id, job_id, pool, job_type, payload, priority, max_retries, \
     error, retry_count, job_created_at, failed_at, reprocessed_at, reprocessed_job_id";

const OWNED_JOB_COLUMNS: &str =
    "id, pool, job_type, payload, priority, retry_count, max_retries, created_at, worker_id";

// =============================================================================
// FAILURE ROUTING
// =============================================================================

/// A processing job row locked for a failure decision.
#[derive(Debug, Clone)]
pub(crate) struct OwnedJob {
    pub id: Uuid,
    pub pool: String,
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub worker_id: Uuid,
}

impl OwnedJob {
    fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            pool: row.try_get("pool")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            worker_id: row.try_get("worker_id")?,
        })
    }
}

/// Lock `job_id` if it is processing under `worker_id`.
pub(crate) async fn lock_owned_job(
    conn: &mut PgConnection,
    job_id: Uuid,
    worker_id: Uuid,
) -> Result<Option<OwnedJob>> {
    let row = sqlx::query(&format!(
        "SELECT {OWNED_JOB_COLUMNS} FROM jobs
         WHERE id = $1 AND status = 'processing' AND worker_id = $2
         FOR UPDATE"
    ))
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;

    row.as_ref().map(OwnedJob::from_row).transpose()
}

/// Lock every job still processing under `worker_id`.
pub(crate) async fn lock_jobs_held_by(
    conn: &mut PgConnection,
    worker_id: Uuid,
) -> Result<Vec<OwnedJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {OWNED_JOB_COLUMNS} FROM jobs
         WHERE worker_id = $1 AND status = 'processing'
         FOR UPDATE"
    ))
    .bind(worker_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    rows.iter().map(OwnedJob::from_row).collect()
}

/// Count the failed attempt and either requeue the job or dead-letter it.
///
/// Fires `job_failed` always, and `job_available` when the job is pending
/// again right away.
pub(crate) async fn route_failure(
    conn: &mut PgConnection,
    job: &OwnedJob,
    error: &str,
    policy: &RetryPolicy,
) -> Result<FailOutcome> {
    let error = strip_nul(error);
    let error = error.as_str();
    let retry_count = job.retry_count + 1;

    let outcome = match policy.decide(retry_count, job.max_retries) {
        RetryDecision::Retry { delay } if delay.is_zero() => {
            sqlx::query(
                "UPDATE jobs
                 SET status = 'pending', retry_count = $2, last_error = $3,
                     worker_id = NULL, started_at = NULL, scheduled_at = NULL
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(retry_count)
            .bind(error)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;

            notify(
                conn,
                &Event::JobAvailable(JobAvailable {
                    pool: job.pool.clone(),
                    job_id: job.id,
                    priority: job.priority,
                    job_type: job.job_type.clone(),
                }),
            )
            .await?;

            FailOutcome::Retrying {
                retry_count,
                retry_at: None,
            }
        }
        RetryDecision::Retry { delay } => {
            let retry_at: DateTime<Utc> = sqlx::query_scalar(
                "UPDATE jobs
                 SET status = 'scheduled', retry_count = $2, last_error = $3,
                     worker_id = NULL, started_at = NULL,
                     scheduled_at = NOW() + make_interval(secs => $4)
                 WHERE id = $1
                 RETURNING scheduled_at",
            )
            .bind(job.id)
            .bind(retry_count)
            .bind(error)
            .bind(delay.as_secs_f64())
            .fetch_one(&mut *conn)
            .await
            .map_err(Error::Database)?;

            FailOutcome::Retrying {
                retry_count,
                retry_at: Some(retry_at),
            }
        }
        RetryDecision::DeadLetter => {
            sqlx::query(
                "UPDATE jobs
                 SET status = 'dead', retry_count = $2, last_error = $3,
                     worker_id = NULL, completed_at = NOW()
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(retry_count)
            .bind(error)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;

            let dead_letter_id = new_v7();
            sqlx::query(
                "INSERT INTO dead_letters
                     (id, job_id, pool, job_type, payload, priority, max_retries,
                      error, retry_count, job_created_at, failed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())",
            )
            .bind(dead_letter_id)
            .bind(job.id)
            .bind(&job.pool)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.priority)
            .bind(job.max_retries)
            .bind(error)
            .bind(retry_count)
            .bind(job.created_at)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;

            warn!(
                subsystem = "db",
                component = "dead_letters",
                op = "dead_letter",
                job_id = %job.id,
                dead_letter_id = %dead_letter_id,
                pool = %job.pool,
                job_type = %job.job_type,
                retry_count,
                "Job exhausted retries, moved to dead letters"
            );

            FailOutcome::DeadLettered {
                retry_count,
                dead_letter_id,
            }
        }
    };

    notify(
        conn,
        &Event::JobFailed(JobFailed {
            job_id: job.id,
            pool: job.pool.clone(),
            worker_id: job.worker_id,
            error: truncate_error(error, defaults::NOTIFY_ERROR_MAX_BYTES),
        }),
    )
    .await?;

    debug!(
        subsystem = "db",
        component = "queue",
        op = "route_failure",
        job_id = %job.id,
        retry_count,
        max_retries = job.max_retries,
        outcome = ?outcome,
        "Routed failed attempt"
    );

    Ok(outcome)
}

// =============================================================================
// REPOSITORY
// =============================================================================

/// PostgreSQL implementation of DeadLetterRepository.
#[derive(Clone)]
pub struct PgDeadLetterRepository {
    pool: Pool<Postgres>,
}

impl PgDeadLetterRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_dead_letter_row(row: &PgRow) -> Result<DeadLetter> {
        Ok(DeadLetter {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            pool: row.try_get("pool")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            max_retries: row.try_get("max_retries")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            job_created_at: row.try_get("job_created_at")?,
            failed_at: row.try_get("failed_at")?,
            reprocessed_at: row.try_get("reprocessed_at")?,
            reprocessed_job_id: row.try_get("reprocessed_job_id")?,
        })
    }
}

#[async_trait]
impl DeadLetterRepository for PgDeadLetterRepository {
    async fn list(&self, pool: Option<&str>, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
             WHERE ($1::text IS NULL OR pool = $1)
             ORDER BY failed_at DESC
             LIMIT $2"
        ))
        .bind(pool)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_dead_letter_row).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_dead_letter_row).transpose()
    }

    async fn count(&self, pool: Option<&str>) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE ($1::text IS NULL OR pool = $1)")
            .bind(pool)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn reprocess(&self, id: Uuid) -> Result<Uuid> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("dead letter {}", id)))?;
        let letter = Self::parse_dead_letter_row(&row)?;

        if let Some(previous) = letter.reprocessed_job_id {
            return Err(Error::InvalidInput(format!(
                "dead letter {} was already reprocessed as job {}",
                id, previous
            )));
        }

        let job_id = new_v7();
        sqlx::query(
            "INSERT INTO jobs (id, pool, job_type, payload, priority, status, max_retries)
             VALUES ($1, $2, $3, $4, $5, 'pending', $6)",
        )
        .bind(job_id)
        .bind(&letter.pool)
        .bind(&letter.job_type)
        .bind(&letter.payload)
        .bind(letter.priority)
        .bind(letter.max_retries)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "UPDATE dead_letters SET reprocessed_at = NOW(), reprocessed_job_id = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        notify(
            &mut *tx,
            &Event::JobAvailable(JobAvailable {
                pool: letter.pool.clone(),
                job_id,
                priority: letter.priority,
                job_type: letter.job_type.clone(),
            }),
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "dead_letters",
            op = "reprocess",
            dead_letter_id = %id,
            original_job_id = %letter.job_id,
            job_id = %job_id,
            pool = %letter.pool,
            "Dead letter reprocessed"
        );
        Ok(job_id)
    }

    async fn purge_reprocessed(&self, retention: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM dead_letters
             WHERE reprocessed_at IS NOT NULL
               AND reprocessed_at < NOW() - make_interval(secs => $1)",
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }
}
