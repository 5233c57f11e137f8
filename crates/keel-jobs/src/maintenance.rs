//! Periodic database maintenance.
//!
//! Each task runs on its own interval, so a slow reindex never delays the
//! promotion of due jobs and a failing task never stops the others.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use keel_core::{
    defaults, DeadLetterRepository, Error, IndexType, JobRepository, RateLimiter, Result,
    VectorRepository, WorkerRepository,
};
use keel_db::Database;

use crate::monitor::{HeartbeatMonitor, MonitorConfig};
use crate::service::ServiceHandle;

const SECS_PER_DAY: u64 = 86_400;

/// One maintenance task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceTask {
    /// Move due scheduled jobs to pending.
    PromoteDue,
    /// Reclaim jobs of workers that stopped heartbeating.
    StaleWorkers,
    /// Delete expired rate-limit windows.
    RateLimits,
    /// Delete completed and dead jobs past retention.
    OldJobs,
    /// Delete reprocessed dead letters past retention.
    DeadLetters,
    /// Rebuild approximate indexes whose row count drifted.
    Reindex,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 6] = [
        MaintenanceTask::PromoteDue,
        MaintenanceTask::StaleWorkers,
        MaintenanceTask::RateLimits,
        MaintenanceTask::OldJobs,
        MaintenanceTask::DeadLetters,
        MaintenanceTask::Reindex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceTask::PromoteDue => "promote-due",
            MaintenanceTask::StaleWorkers => "stale-workers",
            MaintenanceTask::RateLimits => "rate-limits",
            MaintenanceTask::OldJobs => "old-jobs",
            MaintenanceTask::DeadLetters => "dead-letters",
            MaintenanceTask::Reindex => "reindex",
        }
    }
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaintenanceTask {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MaintenanceTask::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown maintenance task: {}", s)))
    }
}

/// Task intervals and retention windows.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub promote_interval_secs: u64,
    pub rate_limit_interval_secs: u64,
    /// Shared by the old-job and dead-letter purges.
    pub cleanup_interval_secs: u64,
    pub reindex_interval_secs: u64,
    pub job_retention_days: u64,
    pub dead_letter_retention_days: u64,
    pub reindex_drift_factor: f64,
    pub monitor: MonitorConfig,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            promote_interval_secs: defaults::MAINTENANCE_PROMOTE_INTERVAL_SECS,
            rate_limit_interval_secs: defaults::MAINTENANCE_RATE_LIMIT_INTERVAL_SECS,
            cleanup_interval_secs: defaults::MAINTENANCE_CLEANUP_INTERVAL_SECS,
            reindex_interval_secs: defaults::MAINTENANCE_REINDEX_INTERVAL_SECS,
            job_retention_days: defaults::JOB_RETENTION_DAYS as u64,
            dead_letter_retention_days: defaults::DEAD_LETTER_RETENTION_DAYS as u64,
            reindex_drift_factor: defaults::REINDEX_DRIFT_FACTOR,
            monitor: MonitorConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl MaintenanceConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MAINTENANCE_PROMOTE_INTERVAL_SECS` | `5` |
    /// | `MAINTENANCE_RATE_LIMIT_INTERVAL_SECS` | `300` |
    /// | `MAINTENANCE_CLEANUP_INTERVAL_SECS` | `3600` |
    /// | `MAINTENANCE_REINDEX_INTERVAL_SECS` | `3600` |
    /// | `JOB_RETENTION_DAYS` | `7` |
    /// | `DEAD_LETTER_RETENTION_DAYS` | `30` |
    /// | `REINDEX_DRIFT_FACTOR` | `2.0` |
    ///
    /// Monitor settings come from [`MonitorConfig::from_env`].
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            promote_interval_secs: env_or(
                "MAINTENANCE_PROMOTE_INTERVAL_SECS",
                base.promote_interval_secs,
            ),
            rate_limit_interval_secs: env_or(
                "MAINTENANCE_RATE_LIMIT_INTERVAL_SECS",
                base.rate_limit_interval_secs,
            ),
            cleanup_interval_secs: env_or(
                "MAINTENANCE_CLEANUP_INTERVAL_SECS",
                base.cleanup_interval_secs,
            ),
            reindex_interval_secs: env_or(
                "MAINTENANCE_REINDEX_INTERVAL_SECS",
                base.reindex_interval_secs,
            ),
            job_retention_days: env_or("JOB_RETENTION_DAYS", base.job_retention_days),
            dead_letter_retention_days: env_or(
                "DEAD_LETTER_RETENTION_DAYS",
                base.dead_letter_retention_days,
            ),
            reindex_drift_factor: env_or("REINDEX_DRIFT_FACTOR", base.reindex_drift_factor)
                .max(1.0),
            monitor: MonitorConfig::from_env(),
        }
    }

    /// Interval at which `task` runs.
    pub fn interval(&self, task: MaintenanceTask) -> Duration {
        let secs = match task {
            MaintenanceTask::PromoteDue => self.promote_interval_secs,
            MaintenanceTask::StaleWorkers => self.monitor.interval_secs,
            MaintenanceTask::RateLimits => self.rate_limit_interval_secs,
            MaintenanceTask::OldJobs | MaintenanceTask::DeadLetters => self.cleanup_interval_secs,
            MaintenanceTask::Reindex => self.reindex_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn job_retention(&self) -> Duration {
        retention(self.job_retention_days)
    }

    pub fn dead_letter_retention(&self) -> Duration {
        retention(self.dead_letter_retention_days)
    }
}

/// Retention in days as a duration, capped at `RETENTION_MAX_DAYS`.
fn retention(days: u64) -> Duration {
    Duration::from_secs(
        days.min(defaults::RETENTION_MAX_DAYS)
            .saturating_mul(SECS_PER_DAY),
    )
}

/// Repositories the scheduler operates on.
#[derive(Clone)]
pub struct MaintenanceContext {
    pub jobs: Arc<dyn JobRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub vectors: Arc<dyn VectorRepository>,
    pub rate_limits: Arc<dyn RateLimiter>,
}

impl From<&Database> for MaintenanceContext {
    fn from(db: &Database) -> Self {
        Self {
            jobs: Arc::new(db.jobs.clone()),
            workers: Arc::new(db.workers.clone()),
            dead_letters: Arc::new(db.dead_letters.clone()),
            vectors: Arc::new(db.vectors.clone()),
            rate_limits: Arc::new(db.rate_limits.clone()),
        }
    }
}

/// Runs every [`MaintenanceTask`] on its own interval.
#[derive(Clone)]
pub struct MaintenanceScheduler {
    ctx: MaintenanceContext,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    pub fn new(ctx: MaintenanceContext, config: MaintenanceConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Run one task now. Returns the number of rows or items it touched.
    pub async fn run_task(&self, task: MaintenanceTask) -> Result<u64> {
        let start = Instant::now();
        let affected = match task {
            MaintenanceTask::PromoteDue => self.ctx.jobs.promote_due().await?,
            MaintenanceTask::StaleWorkers => {
                let sweep = HeartbeatMonitor::new(self.ctx.workers.clone(), self.config.monitor.clone())
                    .run_once()
                    .await?;
                sweep.workers_marked
            }
            MaintenanceTask::RateLimits => self.ctx.rate_limits.cleanup_expired().await?,
            MaintenanceTask::OldJobs => {
                self.ctx
                    .jobs
                    .cleanup_old_jobs(self.config.job_retention())
                    .await?
            }
            MaintenanceTask::DeadLetters => {
                self.ctx
                    .dead_letters
                    .purge_reprocessed(self.config.dead_letter_retention())
                    .await?
            }
            MaintenanceTask::Reindex => self.reindex_drifted().await?,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        if affected > 0 {
            info!(
                subsystem = "jobs",
                component = "maintenance",
                op = task.as_str(),
                rows_affected = affected,
                duration_ms,
                "Maintenance task finished"
            );
        } else {
            debug!(
                subsystem = "jobs",
                component = "maintenance",
                op = task.as_str(),
                duration_ms,
                "Maintenance task found nothing to do"
            );
        }
        Ok(affected)
    }

    /// Rebuild approximate collections whose size drifted since the last rebuild.
    async fn reindex_drifted(&self) -> Result<u64> {
        let mut rebuilt = 0;
        for collection in self.ctx.vectors.list_collections().await? {
            if !collection.index_type.is_approximate()
                || !collection.has_drifted(self.config.reindex_drift_factor)
            {
                continue;
            }
            if collection.index_type == IndexType::Ivf
                && collection.row_count < defaults::REINDEX_MIN_ROWS
            {
                continue;
            }

            match self.ctx.vectors.reindex(&collection.name, None).await {
                Ok(_) => rebuilt += 1,
                Err(Error::ReindexInProgress(_)) => {
                    debug!(collection = %collection.name, "Reindex already running, skipping");
                }
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "maintenance",
                        op = "reindex",
                        collection = %collection.name,
                        error = %e,
                        "Auto-reindex failed"
                    );
                }
            }
        }
        Ok(rebuilt)
    }

    /// Start every task on its interval.
    pub fn start(self) -> ServiceHandle {
        let mut handle = ServiceHandle::new("maintenance");

        for task in MaintenanceTask::ALL {
            let every = self.config.interval(task);
            let scheduler = self.clone();
            handle.spawn_interval(every, move || {
                let scheduler = scheduler.clone();
                async move {
                    if let Err(e) = scheduler.run_task(task).await {
                        error!(
                            subsystem = "jobs",
                            component = "maintenance",
                            op = task.as_str(),
                            error = %e,
                            "Maintenance task failed"
                        );
                    }
                }
            });
        }

        info!(
            subsystem = "jobs",
            component = "maintenance",
            tasks = MaintenanceTask::ALL.len(),
            "Maintenance scheduler started"
        );
        handle
    }
}
