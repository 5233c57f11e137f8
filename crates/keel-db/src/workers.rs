//! Worker registry and stale-worker reclaim.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use keel_core::{
    defaults, new_v7, Error, Event, FailOutcome, Result, RetryPolicy, StaleWorkerSweep, Worker,
    WorkerRepository, WorkerState, WorkerStateChanged,
};

use crate::dead_letters::{lock_jobs_held_by, route_failure};
use crate::notify::notify;

const WORKER_COLUMNS: &str = "id, pool, name, hostname, pid, state, jobs_completed, jobs_failed, \
     current_job, started_at, last_heartbeat";

/// Error recorded on jobs released by a heartbeat timeout.
pub const HEARTBEAT_TIMEOUT_ERROR: &str = "worker heartbeat timeout";

/// Error recorded on jobs released by deregistration.
pub const DEREGISTERED_ERROR: &str = "worker deregistered while holding job";

/// PostgreSQL implementation of WorkerRepository.
#[derive(Clone)]
pub struct PgWorkerRepository {
    pool: Pool<Postgres>,
}

impl PgWorkerRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_worker_row(row: &PgRow) -> Result<Worker> {
        let state: String = row.try_get("state")?;
        Ok(Worker {
            id: row.try_get("id")?,
            pool: row.try_get("pool")?,
            name: row.try_get("name")?,
            hostname: row.try_get("hostname")?,
            pid: row.try_get("pid")?,
            state: state.parse()?,
            jobs_completed: row.try_get("jobs_completed")?,
            jobs_failed: row.try_get("jobs_failed")?,
            current_job: row.try_get("current_job")?,
            started_at: row.try_get("started_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }

    /// Release every job held by a locked worker through the retry policy.
    ///
    /// Returns (requeued, dead_lettered).
    async fn release_held_jobs(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        worker_id: Uuid,
        error: &str,
    ) -> Result<(u64, u64)> {
        let mut requeued = 0;
        let mut dead_lettered = 0;
        for job in lock_jobs_held_by(&mut **tx, worker_id).await? {
            match route_failure(&mut **tx, &job, error, &RetryPolicy::immediate()).await? {
                FailOutcome::Retrying { .. } => requeued += 1,
                FailOutcome::DeadLettered { .. } => dead_lettered += 1,
            }
        }
        Ok((requeued, dead_lettered))
    }
}

/// Hostname reported at registration.
fn local_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
}

#[async_trait]
impl WorkerRepository for PgWorkerRepository {
    async fn register(&self, pool: &str, name: &str) -> Result<Uuid> {
        if pool.trim().is_empty() {
            return Err(Error::InvalidInput("worker pool must not be empty".into()));
        }
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("worker name must not be empty".into()));
        }
        if pool.len() > defaults::JOB_POOL_MAX_LEN {
            return Err(Error::InvalidInput(format!(
                "worker pool is {} bytes, limit is {}",
                pool.len(),
                defaults::JOB_POOL_MAX_LEN
            )));
        }

        let worker_id = new_v7();
        let hostname = local_hostname();
        let pid = std::process::id() as i32;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO workers (id, pool, name, hostname, pid, state)
             VALUES ($1, $2, $3, $4, $5, 'starting')",
        )
        .bind(worker_id)
        .bind(pool)
        .bind(name)
        .bind(&hostname)
        .bind(pid)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        notify(
            &mut *tx,
            &Event::WorkerStateChanged(WorkerStateChanged {
                worker_id,
                pool: pool.to_string(),
                new_state: WorkerState::Starting,
                prev_state: None,
            }),
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "registry",
            op = "register",
            worker_id = %worker_id,
            pool = %pool,
            name = %name,
            hostname = hostname.as_deref().unwrap_or("-"),
            pid,
            "Worker registered"
        );
        Ok(worker_id)
    }

    async fn heartbeat(&self, worker_id: Uuid, state: WorkerState) -> Result<()> {
        // Terminal states release held jobs; only deregister and the sweep
        // may set them.
        if matches!(state, WorkerState::Stopped | WorkerState::Error) {
            return Err(Error::InvalidInput(format!(
                "heartbeat cannot set state {}; deregister the worker instead",
                state
            )));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // idle/processing follow current_job so a heartbeat racing a claim
        // cannot report a stale idle state.
        let row: Option<(String, String, String)> = sqlx::query_as(
            "WITH prev AS (
                 SELECT id, state FROM workers WHERE id = $1 FOR UPDATE
             )
             UPDATE workers w
             SET last_heartbeat = NOW(),
                 state = CASE
                     WHEN $2 IN ('idle', 'processing') THEN
                         CASE WHEN w.current_job IS NULL THEN 'idle' ELSE 'processing' END
                     ELSE $2
                 END
             FROM prev
             WHERE w.id = prev.id
             RETURNING w.pool, prev.state, w.state",
        )
        .bind(worker_id)
        .bind(state.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some((pool, prev_state, new_state)) = row else {
            return Err(Error::NotFound(format!("worker {}", worker_id)));
        };

        if prev_state != new_state {
            let prev_state: WorkerState = prev_state.parse()?;
            let new_state: WorkerState = new_state.parse()?;
            notify(
                &mut *tx,
                &Event::WorkerStateChanged(WorkerStateChanged {
                    worker_id,
                    pool: pool.clone(),
                    new_state,
                    prev_state: Some(prev_state),
                }),
            )
            .await?;
            debug!(
                subsystem = "db",
                component = "registry",
                op = "heartbeat",
                worker_id = %worker_id,
                pool = %pool,
                prev_state = %prev_state,
                new_state = %new_state,
                "Worker state changed"
            );
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn deregister(&self, worker_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row: Option<(String, String)> =
            sqlx::query_as("SELECT pool, state FROM workers WHERE id = $1 FOR UPDATE")
                .bind(worker_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;
        let Some((pool, prev_state)) = row else {
            return Err(Error::NotFound(format!("worker {}", worker_id)));
        };
        let prev_state: WorkerState = prev_state.parse()?;

        let (requeued, dead_lettered) =
            Self::release_held_jobs(&mut tx, worker_id, DEREGISTERED_ERROR).await?;

        sqlx::query("UPDATE workers SET state = 'stopped', current_job = NULL WHERE id = $1")
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        if prev_state != WorkerState::Stopped {
            notify(
                &mut *tx,
                &Event::WorkerStateChanged(WorkerStateChanged {
                    worker_id,
                    pool: pool.clone(),
                    new_state: WorkerState::Stopped,
                    prev_state: Some(prev_state),
                }),
            )
            .await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "registry",
            op = "deregister",
            worker_id = %worker_id,
            pool = %pool,
            jobs_requeued = requeued,
            jobs_dead_lettered = dead_lettered,
            "Worker deregistered"
        );
        Ok(())
    }

    async fn get(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        let row = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"))
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_worker_row).transpose()
    }

    async fn list(&self, pool: Option<&str>) -> Result<Vec<Worker>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers
             WHERE ($1::text IS NULL OR pool = $1)
             ORDER BY pool, started_at"
        ))
        .bind(pool)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_worker_row).collect()
    }

    async fn cleanup_stale_workers(&self, timeout: Duration) -> Result<StaleWorkerSweep> {
        let timeout_secs = timeout.as_secs_f64();

        let candidates: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM workers
             WHERE (state NOT IN ('stopped', 'error')
                    AND last_heartbeat < NOW() - make_interval(secs => $1))
                OR (state IN ('stopped', 'error') AND current_job IS NOT NULL)",
        )
        .bind(timeout_secs)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut sweep = StaleWorkerSweep::default();

        for worker_id in candidates {
            let mut tx = self.pool.begin().await.map_err(Error::Database)?;

            // Re-check under the row lock: a heartbeat may have landed since
            // the scan, or another monitor may own this worker right now.
            let row: Option<(String, String)> = sqlx::query_as(
                "SELECT pool, state FROM workers
                 WHERE id = $1
                   AND ((state NOT IN ('stopped', 'error')
                         AND last_heartbeat < NOW() - make_interval(secs => $2))
                        OR (state IN ('stopped', 'error') AND current_job IS NOT NULL))
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(worker_id)
            .bind(timeout_secs)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;

            let Some((pool, prev_state)) = row else {
                continue;
            };
            let prev_state: WorkerState = prev_state.parse()?;

            let (requeued, dead_lettered) =
                Self::release_held_jobs(&mut tx, worker_id, HEARTBEAT_TIMEOUT_ERROR).await?;

            sqlx::query("UPDATE workers SET state = 'error', current_job = NULL WHERE id = $1")
                .bind(worker_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            if prev_state != WorkerState::Error {
                notify(
                    &mut *tx,
                    &Event::WorkerStateChanged(WorkerStateChanged {
                        worker_id,
                        pool: pool.clone(),
                        new_state: WorkerState::Error,
                        prev_state: Some(prev_state),
                    }),
                )
                .await?;
            }

            tx.commit().await.map_err(Error::Database)?;

            warn!(
                subsystem = "db",
                component = "monitor",
                op = "reclaim",
                worker_id = %worker_id,
                pool = %pool,
                prev_state = %prev_state,
                jobs_requeued = requeued,
                jobs_dead_lettered = dead_lettered,
                timeout_secs = timeout.as_secs(),
                "Stale worker reclaimed"
            );

            sweep.workers_marked += 1;
            sweep.jobs_requeued += requeued;
            sweep.jobs_dead_lettered += dead_lettered;
        }

        Ok(sweep)
    }
}
