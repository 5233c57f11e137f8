//! Job worker and runner for processing background jobs.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use keel_core::events::strip_nul;
use keel_core::{
    defaults, handler_fn, Dispatcher, Error, EventKind, FailOutcome, Job, JobRepository, Result,
    SubscriptionId, WorkerRepository, WorkerState,
};
use keel_db::Database;

use crate::handler::{JobContext, JobHandler, JobResult};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pool this worker claims from.
    pub pool: String,
    /// Base name; each slot registers as `<name>-<slot>`.
    pub name: String,
    /// Fallback polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Number of concurrency slots.
    pub max_concurrent_jobs: usize,
    pub heartbeat_interval_secs: u64,
    /// Per-job execution timeout.
    pub job_timeout_secs: u64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool: defaults::WORKER_POOL.to_string(),
            name: default_worker_name(),
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            heartbeat_interval_secs: defaults::WORKER_HEARTBEAT_INTERVAL_SECS,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            enabled: true,
        }
    }
}

fn default_worker_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "keel-worker".to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_WORKER_POOL` | `default` | Pool to claim from |
    /// | `JOB_WORKER_NAME` | `$HOSTNAME` | Base worker name |
    /// | `JOB_MAX_CONCURRENT` | `4` | Concurrency slots |
    /// | `JOB_POLL_INTERVAL_MS` | `5000` | Polling interval when no notification arrives |
    /// | `WORKER_HEARTBEAT_INTERVAL_SECS` | `30` | Heartbeat cadence per slot |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job execution timeout |
    pub fn from_env() -> Self {
        let base = Self::default();

        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            pool: std::env::var("JOB_WORKER_POOL").unwrap_or(base.pool),
            name: std::env::var("JOB_WORKER_NAME").unwrap_or(base.name),
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS").unwrap_or(base.poll_interval_ms),
            max_concurrent_jobs: env_parse::<usize>("JOB_MAX_CONCURRENT")
                .unwrap_or(base.max_concurrent_jobs)
                .max(1),
            heartbeat_interval_secs: env_parse("WORKER_HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(base.heartbeat_interval_secs),
            job_timeout_secs: env_parse("JOB_TIMEOUT_SECS").unwrap_or(base.job_timeout_secs),
            enabled,
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A slot registered and started claiming.
    WorkerStarted { worker_id: Uuid },
    /// A job was started.
    JobStarted {
        job_id: Uuid,
        job_type: String,
        worker_id: Uuid,
    },
    /// Job progress was updated.
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    /// A job completed successfully.
    JobCompleted { job_id: Uuid, job_type: String },
    /// A job failed and was routed to retry or the dead-letter store.
    JobFailed {
        job_id: Uuid,
        job_type: String,
        error: String,
        outcome: FailOutcome,
    },
    /// A slot deregistered.
    WorkerStopped { worker_id: Uuid },
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<WorkerEvent>,
    tasks: Vec<JoinHandle<()>>,
    subscription: Option<(Dispatcher, SubscriptionId)>,
}

impl WorkerHandle {
    /// Stop claiming, let in-flight jobs finish, and deregister every slot.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        if let Some((dispatcher, id)) = self.subscription {
            dispatcher.unsubscribe(id);
        }

        for task in self.tasks {
            if let Err(e) = task.await {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    error = %e,
                    "Worker slot task failed"
                );
            }
        }
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Number of slots still running.
    pub fn running_slots(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>;

/// Job worker that processes jobs from one pool.
///
/// Every concurrency slot is a separate registered worker with its own
/// heartbeat, so a crashed slot's claim is reclaimed independently.
pub struct JobWorker {
    jobs: Arc<dyn JobRepository>,
    workers: Arc<dyn WorkerRepository>,
    dispatcher: Option<Dispatcher>,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    wake: Arc<Notify>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        workers: Arc<dyn WorkerRepository>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::WORKER_EVENT_CAPACITY);
        Self {
            jobs,
            workers,
            dispatcher: None,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Wake idle slots on `job_available` events for this pool.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Register a handler for a job type.
    pub async fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        self.insert_handler(Arc::new(handler)).await;
    }

    async fn insert_handler(&self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        let mut handlers = self.handlers.write().await;
        debug!(job_type = %job_type, "Registered job handler");
        handlers.insert(job_type, handler);
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Get the pending job count of this worker's pool.
    pub async fn pending_count(&self) -> Result<i64> {
        self.jobs.pending_count(&self.config.pool).await
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_tx = self.event_tx.clone();

        if !self.config.enabled {
            info!(
                subsystem = "jobs",
                component = "worker",
                pool = %self.config.pool,
                "Job worker is disabled, not starting"
            );
            return WorkerHandle {
                shutdown_tx,
                event_tx,
                tasks: Vec::new(),
                subscription: None,
            };
        }

        let subscription = self.dispatcher.clone().map(|dispatcher| {
            let wake = self.wake.clone();
            let pool = self.config.pool.clone();
            let id = dispatcher.subscribe(
                EventKind::JobAvailable,
                handler_fn(move |event| {
                    let for_us = event.pool() == pool;
                    let wake = wake.clone();
                    async move {
                        if for_us {
                            wake.notify_waiters();
                        }
                        Ok(())
                    }
                }),
            );
            (dispatcher, id)
        });

        info!(
            subsystem = "jobs",
            component = "worker",
            pool = %self.config.pool,
            slots = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval_ms,
            "Job worker started"
        );

        let slots = self.config.max_concurrent_jobs.max(1);
        let worker = Arc::new(self);
        let tasks = (0..slots)
            .map(|slot| {
                let worker = worker.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { worker.run_slot(slot, shutdown_rx).await })
            })
            .collect();

        WorkerHandle {
            shutdown_tx,
            event_tx,
            tasks,
            subscription,
        }
    }

    /// One concurrency slot: register, claim until shutdown, deregister.
    ///
    /// A claim whose outcome cannot be recorded ends the registration. The
    /// slot stops heartbeating, deregisters and registers again under a new
    /// worker id, so the held job is released or reclaimed by the monitor.
    #[instrument(skip(self, shutdown), fields(pool = %self.config.pool))]
    async fn run_slot(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let name = format!("{}-{}", self.config.name, slot);
        while let Some(worker_id) = self.register_slot(&name, &mut shutdown).await {
            if !self.run_registration(worker_id, &mut shutdown).await {
                break;
            }
        }
    }

    /// Register the slot, retrying transient errors until shutdown.
    async fn register_slot(
        &self,
        name: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Uuid> {
        let retry_every = Duration::from_millis(
            self.config
                .poll_interval_ms
                .max(defaults::JOB_SETTLE_BACKOFF_MS),
        );
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.workers.register(&self.config.pool, name).await {
                Ok(id) => return Some(id),
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "worker",
                        worker_name = %name,
                        error = %e,
                        "Failed to register worker slot"
                    );
                    if !e.is_transient() {
                        return None;
                    }
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = sleep(retry_every) => {}
            }
        }
    }

    /// Claim under one registration until shutdown or an unrecorded outcome.
    ///
    /// Returns `true` when the slot should register again.
    async fn run_registration(
        &self,
        worker_id: Uuid,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        if let Err(e) = self.workers.heartbeat(worker_id, WorkerState::Idle).await {
            warn!(worker_id = %worker_id, error = %e, "Initial heartbeat failed");
        }
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted { worker_id });

        let (beat_stop, beat_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.workers.clone(),
            worker_id,
            Duration::from_secs(self.config.heartbeat_interval_secs.max(1)),
            beat_rx,
        ));

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut unsettled = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Registered before the claim so a notification racing an empty
            // claim still wakes this slot.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.jobs.claim(&self.config.pool, worker_id).await {
                Ok(Some(job)) => {
                    if self.execute_job(worker_id, job).await {
                        continue;
                    }
                    unsettled = true;
                    break;
                }
                Ok(None) => {}
                Err(Error::WorkerNotActive(_)) => {
                    warn!(
                        subsystem = "jobs",
                        component = "worker",
                        worker_id = %worker_id,
                        "Worker was marked inactive, reviving"
                    );
                    if let Err(e) = self.workers.heartbeat(worker_id, WorkerState::Idle).await {
                        error!(worker_id = %worker_id, error = %e, "Failed to revive worker");
                    }
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "worker",
                        worker_id = %worker_id,
                        error = %e,
                        "Failed to claim job"
                    );
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut notified => {}
                _ = sleep(poll_interval) => {}
            }
        }

        let _ = beat_stop.send(true);
        if let Err(e) = heartbeat.await {
            error!(worker_id = %worker_id, error = %e, "Heartbeat task failed");
        }
        // If this fails the heartbeat is already gone, so the monitor
        // reclaims whatever the worker still holds.
        if let Err(e) = self.workers.deregister(worker_id).await {
            error!(worker_id = %worker_id, error = %e, "Failed to deregister worker");
        }
        let _ = self.event_tx.send(WorkerEvent::WorkerStopped { worker_id });
        info!(
            subsystem = "jobs",
            component = "worker",
            worker_id = %worker_id,
            unsettled,
            "Worker slot stopped"
        );

        let stopping = *shutdown.borrow();
        unsettled && !stopping
    }

    /// Execute a single claimed job and record the outcome.
    ///
    /// Returns `false` when no outcome could be recorded and the job may
    /// still be held by `worker_id`.
    async fn execute_job(&self, worker_id: Uuid, job: Job) -> bool {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type.clone();

        info!(
            subsystem = "jobs",
            component = "worker",
            op = "execute",
            job_id = %job_id,
            job_type = %job_type,
            worker_id = %worker_id,
            attempt = job.retry_count + 1,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            job_type: job_type.clone(),
            worker_id,
        });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&job_type).cloned()
        };

        let result = match handler {
            Some(handler) => self.run_handler(handler, job, worker_id).await,
            None => {
                warn!(job_type = %job_type, "No handler registered for job type");
                JobResult::Failed(format!("No handler registered for job type: {}", job_type))
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let message = match result {
            JobResult::Success(data) => match self.complete_job(job_id, worker_id, data).await {
                Ok(()) => {
                    info!(
                        subsystem = "jobs",
                        component = "worker",
                        job_id = %job_id,
                        job_type = %job_type,
                        duration_ms,
                        "Job completed successfully"
                    );
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::JobCompleted { job_id, job_type });
                    return true;
                }
                Err(e @ Error::StaleClaim { .. }) => {
                    warn!(job_id = %job_id, error = %e, "Claim lost before completion");
                    return true;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to store job result");
                    format!("Failed to store job result: {}", e)
                }
            },
            JobResult::Failed(message) => message,
        };

        let message = strip_nul(&message);
        match self.fail_job(job_id, worker_id, &message).await {
            Ok(outcome) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_type = %job_type,
                    error = %message,
                    duration_ms,
                    ?outcome,
                    "Job failed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    job_type,
                    error: message,
                    outcome,
                });
                true
            }
            Err(e @ Error::StaleClaim { .. }) => {
                warn!(job_id = %job_id, error = %e, "Claim lost before failure was recorded");
                true
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Failed to mark job as failed, giving up claim"
                );
                false
            }
        }
    }

    /// `complete`, retried on transient errors.
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        data: Option<JsonValue>,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.jobs.complete(job_id, worker_id, data.clone()).await {
                Err(e) if e.is_transient() && attempt < defaults::JOB_SETTLE_ATTEMPTS => {
                    settle_backoff(job_id, attempt, &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// `fail`, retried on transient errors.
    async fn fail_job(&self, job_id: Uuid, worker_id: Uuid, message: &str) -> Result<FailOutcome> {
        let mut attempt = 1;
        loop {
            match self.jobs.fail(job_id, worker_id, message).await {
                Err(e) if e.is_transient() && attempt < defaults::JOB_SETTLE_ATTEMPTS => {
                    settle_backoff(job_id, attempt, &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run a handler under the job timeout, converting panics to failures.
    async fn run_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        job: Job,
        worker_id: Uuid,
    ) -> JobResult {
        let job_id = job.id;
        let event_tx = self.event_tx.clone();
        let ctx = JobContext::new(job, worker_id).with_progress_callback(move |percent, message| {
            let _ = event_tx.send(WorkerEvent::JobProgress {
                job_id,
                percent,
                message: message.map(String::from),
            });
        });

        let timeout = Duration::from_secs(self.config.job_timeout_secs);
        let run = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();
        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!(job_id = %job_id, "Job handler panicked");
                JobResult::Failed("Job handler panicked".to_string())
            }
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    "Job exceeded timeout of {}s", self.config.job_timeout_secs
                );
                JobResult::Failed(format!(
                    "Job exceeded timeout of {}s",
                    self.config.job_timeout_secs
                ))
            }
        }
    }
}

async fn settle_backoff(job_id: Uuid, attempt: u32, error: &Error) {
    let delay = Duration::from_millis(defaults::JOB_SETTLE_BACKOFF_MS * u64::from(attempt));
    warn!(
        subsystem = "jobs",
        component = "worker",
        job_id = %job_id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Recording job outcome failed, retrying"
    );
    sleep(delay).await;
}

/// Report liveness on a fixed cadence until shutdown.
async fn heartbeat_loop(
    workers: Arc<dyn WorkerRepository>,
    worker_id: Uuid,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                // The registry derives idle/processing from the held job.
                if let Err(e) = workers.heartbeat(worker_id, WorkerState::Idle).await {
                    warn!(
                        subsystem = "jobs",
                        component = "worker",
                        worker_id = %worker_id,
                        error = %e,
                        "Heartbeat failed"
                    );
                }
            }
        }
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    jobs: Arc<dyn JobRepository>,
    workers: Arc<dyn WorkerRepository>,
    dispatcher: Option<Dispatcher>,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(jobs: Arc<dyn JobRepository>, workers: Arc<dyn WorkerRepository>) -> Self {
        Self {
            jobs,
            workers,
            dispatcher: None,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Builder over the PostgreSQL repositories of `db`.
    pub fn from_database(db: &Database) -> Self {
        Self::new(Arc::new(db.jobs.clone()), Arc::new(db.workers.clone()))
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> JobWorker {
        let mut worker = JobWorker::new(self.jobs, self.workers, self.config);
        if let Some(dispatcher) = self.dispatcher {
            worker = worker.with_dispatcher(dispatcher);
        }

        for handler in self.handlers {
            worker.insert_handler(handler).await;
        }

        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoOpHandler;
    use crate::testing::{sample_job, FakeJobs, FakeWorkers};
    use async_trait::async_trait;
    use keel_core::{Event, JobAvailable, JobStatus};
    use std::sync::atomic::Ordering;

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        fn job_type(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            JobResult::Failed("upstream unavailable".to_string())
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        fn job_type(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            sleep(Duration::from_secs(3_600)).await;
            JobResult::Success(None)
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        fn job_type(&self) -> &str {
            "boom"
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            panic!("handler bug");
        }
    }

    /// Returns a result PostgreSQL jsonb cannot store.
    struct NulResultHandler;

    #[async_trait]
    impl JobHandler for NulResultHandler {
        fn job_type(&self) -> &str {
            "nul_result"
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            JobResult::Success(Some(serde_json::json!({ "s": "a\u{0}b" })))
        }
    }

    struct NulErrorHandler;

    #[async_trait]
    impl JobHandler for NulErrorHandler {
        fn job_type(&self) -> &str {
            "nul_error"
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            JobResult::Failed("bad\0byte".to_string())
        }
    }

    fn fakes() -> (Arc<FakeJobs>, Arc<FakeWorkers>) {
        (Arc::new(FakeJobs::default()), Arc::new(FakeWorkers::default()))
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_pool("p")
            .with_name("test")
            .with_poll_interval(10)
            .with_max_concurrent(1)
    }

    async fn next_matching<F>(events: &mut broadcast::Receiver<WorkerEvent>, pred: F) -> WorkerEvent
    where
        F: Fn(&WorkerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received")
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.pool, "default");
        assert_eq!(config.poll_interval_ms, defaults::JOB_POLL_INTERVAL_MS);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.job_timeout_secs, 300);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_pool("ingest")
            .with_name("box-1")
            .with_poll_interval(1000)
            .with_max_concurrent(8)
            .with_heartbeat_interval(5)
            .with_job_timeout(60)
            .with_enabled(false);

        assert_eq!(config.pool, "ingest");
        assert_eq!(config.name, "box-1");
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.job_timeout_secs, 60);
        assert!(!config.enabled);
    }

    #[tokio::test]
    async fn test_worker_completes_claimed_job() {
        let (jobs, workers) = fakes();
        let job_id = jobs.push(sample_job("p", "embed"));

        let worker = WorkerBuilder::new(jobs.clone(), workers.clone())
            .with_config(test_config())
            .with_handler(NoOpHandler::new("embed"))
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let event = next_matching(&mut events, |e| {
            matches!(e, WorkerEvent::JobCompleted { .. })
        })
        .await;
        match event {
            WorkerEvent::JobCompleted { job_id: id, job_type } => {
                assert_eq!(id, job_id);
                assert_eq!(job_type, "embed");
            }
            other => panic!("unexpected event {:?}", other),
        }

        handle.shutdown().await.unwrap();

        assert_eq!(jobs.status(job_id), Some(JobStatus::Completed));
        let completed = jobs.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        let deregistered = workers.deregistered.lock().unwrap();
        assert_eq!(deregistered.len(), 1);
        assert_eq!(completed[0].1, deregistered[0]);
    }

    #[tokio::test]
    async fn test_progress_events_are_forwarded() {
        let (jobs, workers) = fakes();
        jobs.push(sample_job("p", "embed"));

        let worker = WorkerBuilder::new(jobs.clone(), workers)
            .with_config(test_config())
            .with_handler(NoOpHandler::new("embed"))
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let event = next_matching(&mut events, |e| {
            matches!(e, WorkerEvent::JobProgress { .. })
        })
        .await;
        assert!(matches!(event, WorkerEvent::JobProgress { percent: 50, .. }));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_handler_fails_job() {
        let (jobs, workers) = fakes();
        let mut job = sample_job("p", "unknown");
        job.max_retries = 0;
        let job_id = jobs.push(job);

        let worker = JobWorker::new(jobs.clone(), workers, test_config());
        let mut events = worker.events();
        let handle = worker.start();

        let event = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
        match event {
            WorkerEvent::JobFailed { error, outcome, .. } => {
                assert_eq!(error, "No handler registered for job type: unknown");
                assert!(matches!(outcome, FailOutcome::DeadLettered { retry_count: 1, .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }

        handle.shutdown().await.unwrap();
        assert_eq!(jobs.status(job_id), Some(JobStatus::Dead));
    }

    #[tokio::test]
    async fn test_failed_job_is_routed_to_retry() {
        let (jobs, workers) = fakes();
        let mut job = sample_job("p", "flaky");
        job.max_retries = 1;
        let job_id = jobs.push(job);

        let worker = WorkerBuilder::new(jobs.clone(), workers)
            .with_config(test_config())
            .with_handler(FailingHandler)
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let first = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
        assert!(matches!(
            first,
            WorkerEvent::JobFailed {
                outcome: FailOutcome::Retrying { retry_count: 1, .. },
                ..
            }
        ));

        // The retried job is claimed again and then exhausts its budget.
        let second = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
        assert!(matches!(
            second,
            WorkerEvent::JobFailed {
                outcome: FailOutcome::DeadLettered { retry_count: 2, .. },
                ..
            }
        ));

        handle.shutdown().await.unwrap();
        assert_eq!(jobs.status(job_id), Some(JobStatus::Dead));
        assert_eq!(jobs.failed.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_fails_job() {
        let (jobs, workers) = fakes();
        let mut job = sample_job("p", "slow");
        job.max_retries = 0;
        jobs.push(job);

        let worker = WorkerBuilder::new(jobs.clone(), workers)
            .with_config(test_config().with_job_timeout(2))
            .with_handler(SlowHandler)
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let event = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
        match event {
            WorkerEvent::JobFailed { error, .. } => {
                assert_eq!(error, "Job exceeded timeout of 2s");
            }
            other => panic!("unexpected event {:?}", other),
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_job() {
        let (jobs, workers) = fakes();
        jobs.push(sample_job("p", "boom"));

        let worker = WorkerBuilder::new(jobs.clone(), workers)
            .with_config(test_config())
            .with_handler(PanickingHandler)
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let event = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
        match event {
            WorkerEvent::JobFailed { error, .. } => assert_eq!(error, "Job handler panicked"),
            other => panic!("unexpected event {:?}", other),
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_each_slot_registers_its_own_worker() {
        let (jobs, workers) = fakes();

        let worker = JobWorker::new(
            jobs,
            workers.clone(),
            test_config().with_max_concurrent(3),
        );
        let mut events = worker.events();
        let handle = worker.start();

        for _ in 0..3 {
            next_matching(&mut events, |e| matches!(e, WorkerEvent::WorkerStarted { .. })).await;
        }
        assert_eq!(handle.running_slots(), 3);

        handle.shutdown().await.unwrap();

        let registered = workers.workers.lock().unwrap();
        assert_eq!(registered.len(), 3);
        assert!(registered.values().all(|w| w.state == WorkerState::Stopped));
        let mut names: Vec<_> = registered.values().map(|w| w.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["test-0", "test-1", "test-2"]);
    }

    #[tokio::test]
    async fn test_disabled_worker_does_not_start() {
        let (jobs, workers) = fakes();
        jobs.push(sample_job("p", "embed"));

        let worker = JobWorker::new(jobs.clone(), workers.clone(), test_config().with_enabled(false));
        let handle = worker.start();
        assert_eq!(handle.running_slots(), 0);
        handle.shutdown().await.unwrap();

        assert!(workers.workers.lock().unwrap().is_empty());
        assert!(jobs.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_available_wakes_idle_slot() {
        let (jobs, workers) = fakes();
        let dispatcher = Dispatcher::default();

        let worker = WorkerBuilder::new(jobs.clone(), workers)
            .with_config(test_config().with_poll_interval(3_600_000))
            .with_dispatcher(dispatcher.clone())
            .with_handler(NoOpHandler::new("embed"))
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();
        next_matching(&mut events, |e| matches!(e, WorkerEvent::WorkerStarted { .. })).await;

        let job_id = jobs.push(sample_job("p", "embed"));
        dispatcher.publish(Event::JobAvailable(JobAvailable {
            pool: "p".to_string(),
            job_id,
            priority: 5,
            job_type: "embed".to_string(),
        }));

        let event = next_matching(&mut events, |e| {
            matches!(e, WorkerEvent::JobCompleted { .. })
        })
        .await;
        assert!(matches!(event, WorkerEvent::JobCompleted { job_id: id, .. } if id == job_id));

        handle.shutdown().await.unwrap();
        assert_eq!(dispatcher.subscriber_count(EventKind::JobAvailable), 0);
    }

    #[tokio::test]
    async fn test_unstorable_result_fails_job_and_slot_keeps_claiming() {
        let (jobs, workers) = fakes();
        let mut first = sample_job("p", "nul_result");
        first.priority = 1;
        first.max_retries = 0;
        let first_id = jobs.push(first);
        let second_id = jobs.push(sample_job("p", "embed"));

        let worker = WorkerBuilder::new(jobs.clone(), workers.clone())
            .with_config(test_config())
            .with_handler(NulResultHandler)
            .with_handler(NoOpHandler::new("embed"))
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let event = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
        match event {
            WorkerEvent::JobFailed {
                job_id,
                error,
                outcome,
                ..
            } => {
                assert_eq!(job_id, first_id);
                assert!(error.starts_with("Failed to store job result"), "{}", error);
                assert!(matches!(outcome, FailOutcome::DeadLettered { .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let event = next_matching(&mut events, |e| {
            matches!(e, WorkerEvent::JobCompleted { .. })
        })
        .await;
        assert!(matches!(event, WorkerEvent::JobCompleted { job_id, .. } if job_id == second_id));

        handle.shutdown().await.unwrap();
        assert_eq!(jobs.status(first_id), Some(JobStatus::Dead));
        assert_eq!(jobs.status(second_id), Some(JobStatus::Completed));
        assert_eq!(workers.deregistered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nul_in_failure_message_is_stripped() {
        let (jobs, workers) = fakes();
        jobs.push(sample_job("p", "nul_error"));

        let worker = WorkerBuilder::new(jobs.clone(), workers)
            .with_config(test_config())
            .with_handler(NulErrorHandler)
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let event = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
        match event {
            WorkerEvent::JobFailed { error, .. } => assert_eq!(error, "badbyte"),
            other => panic!("unexpected event {:?}", other),
        }

        handle.shutdown().await.unwrap();
        assert_eq!(jobs.failed.lock().unwrap()[0].2, "badbyte");
    }

    #[tokio::test]
    async fn test_transient_fail_errors_are_retried() {
        let (jobs, workers) = fakes();
        jobs.transient_fail_errors.store(2, Ordering::SeqCst);
        let mut job = sample_job("p", "flaky");
        job.max_retries = 0;
        let job_id = jobs.push(job);

        let worker = WorkerBuilder::new(jobs.clone(), workers.clone())
            .with_config(test_config())
            .with_handler(FailingHandler)
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let event = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
        assert!(matches!(
            event,
            WorkerEvent::JobFailed {
                outcome: FailOutcome::DeadLettered { .. },
                ..
            }
        ));

        handle.shutdown().await.unwrap();
        assert_eq!(jobs.transient_fail_errors.load(Ordering::SeqCst), 0);
        assert_eq!(jobs.failed.lock().unwrap().len(), 1);
        assert_eq!(jobs.status(job_id), Some(JobStatus::Dead));
        assert_eq!(workers.deregistered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_failure_gives_up_claim_and_reregisters() {
        let (jobs, workers) = fakes();
        jobs.fail_writes_down.store(true, Ordering::SeqCst);
        let job_id = jobs.push(sample_job("p", "flaky"));

        let worker = WorkerBuilder::new(jobs.clone(), workers.clone())
            .with_config(test_config())
            .with_handler(FailingHandler)
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let started = |e: &WorkerEvent| matches!(e, WorkerEvent::WorkerStarted { .. });
        let first = match next_matching(&mut events, started).await {
            WorkerEvent::WorkerStarted { worker_id } => worker_id,
            other => panic!("unexpected event {:?}", other),
        };
        match next_matching(&mut events, |e| matches!(e, WorkerEvent::WorkerStopped { .. })).await
        {
            WorkerEvent::WorkerStopped { worker_id } => assert_eq!(worker_id, first),
            other => panic!("unexpected event {:?}", other),
        }
        let second = match next_matching(&mut events, started).await {
            WorkerEvent::WorkerStarted { worker_id } => worker_id,
            other => panic!("unexpected event {:?}", other),
        };
        assert_ne!(first, second);
        // The old registration no longer heartbeats, so its job is reclaimable.
        assert_eq!(workers.state(first), Some(WorkerState::Stopped));

        handle.shutdown().await.unwrap();
        assert_eq!(*workers.deregistered.lock().unwrap(), vec![first, second]);
        assert!(jobs.failed.lock().unwrap().is_empty());
        assert_eq!(jobs.status(job_id), Some(JobStatus::Processing));
    }
}
