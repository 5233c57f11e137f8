//! Heartbeat monitor: reclaims jobs held by workers that stopped reporting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use keel_core::{defaults, Result, StaleWorkerSweep, WorkerRepository};

use crate::service::ServiceHandle;

/// Monitor cadence and the silence threshold.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Workers silent for longer than this are reclaimed.
    pub timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::WORKER_MONITOR_INTERVAL_SECS,
            timeout_secs: defaults::WORKER_HEARTBEAT_TIMEOUT_SECS,
        }
    }
}

impl MonitorConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `WORKER_MONITOR_INTERVAL_SECS` | `30` |
    /// | `WORKER_HEARTBEAT_TIMEOUT_SECS` | `120` |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            interval_secs: std::env::var("WORKER_MONITOR_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.interval_secs),
            timeout_secs: std::env::var("WORKER_HEARTBEAT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.timeout_secs),
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Periodic stale-worker sweep with an explicit start/shutdown lifecycle.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    workers: Arc<dyn WorkerRepository>,
    config: MonitorConfig,
}

impl HeartbeatMonitor {
    pub fn new(workers: Arc<dyn WorkerRepository>, config: MonitorConfig) -> Self {
        Self { workers, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run one sweep now.
    pub async fn run_once(&self) -> Result<StaleWorkerSweep> {
        let start = Instant::now();
        let sweep = self
            .workers
            .cleanup_stale_workers(Duration::from_secs(self.config.timeout_secs))
            .await?;

        if sweep.workers_marked > 0 {
            warn!(
                subsystem = "jobs",
                component = "monitor",
                op = "reclaim",
                workers_marked = sweep.workers_marked,
                jobs_requeued = sweep.jobs_requeued,
                jobs_dead_lettered = sweep.jobs_dead_lettered,
                duration_ms = start.elapsed().as_millis() as u64,
                "Reclaimed stale workers"
            );
        } else {
            debug!(
                subsystem = "jobs",
                component = "monitor",
                duration_ms = start.elapsed().as_millis() as u64,
                "No stale workers"
            );
        }
        Ok(sweep)
    }

    /// Sweep on the configured interval until the handle is shut down.
    pub fn start(self) -> ServiceHandle {
        let mut handle = ServiceHandle::new("heartbeat_monitor");
        let every = Duration::from_secs(self.config.interval_secs.max(1));

        info!(
            subsystem = "jobs",
            component = "monitor",
            interval_secs = every.as_secs(),
            timeout_secs = self.config.timeout_secs,
            "Heartbeat monitor started"
        );

        handle.spawn_interval(every, move || {
            let monitor = self.clone();
            async move {
                if let Err(e) = monitor.run_once().await {
                    error!(
                        subsystem = "jobs",
                        component = "monitor",
                        error = %e,
                        "Stale worker sweep failed"
                    );
                }
            }
        });
        handle
    }
}
