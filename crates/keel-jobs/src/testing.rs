//! In-memory repositories for unit tests of the runtime services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use keel_core::{
    CreateCollectionRequest, DeadLetter, DeadLetterRepository, EnqueueRequest, Error, FailOutcome,
    IndexConfig, IndexType, Job, JobFilter, JobRepository, JobStatus, QueueStats, RateLimitDecision,
    RateLimiter, RecallTarget, Result, SearchRequest, SearchResult, StaleWorkerSweep,
    VectorCollection, VectorRepository, Worker, WorkerRepository, WorkerState,
};

pub fn sample_job(pool: &str, job_type: &str) -> Job {
    Job {
        id: Uuid::new_v4(),
        pool: pool.to_string(),
        job_type: job_type.to_string(),
        payload: json!({"n": 1}),
        priority: 5,
        status: JobStatus::Pending,
        created_at: Utc::now(),
        scheduled_at: None,
        started_at: None,
        completed_at: None,
        worker_id: None,
        retry_count: 0,
        max_retries: 3,
        last_error: None,
        result: None,
    }
}

// =============================================================================
// JOBS
// =============================================================================

#[derive(Default)]
pub struct FakeJobs {
    pub jobs: Mutex<Vec<Job>>,
    pub completed: Mutex<Vec<(Uuid, Uuid, Option<JsonValue>)>>,
    pub failed: Mutex<Vec<(Uuid, Uuid, String)>>,
    pub promote_calls: AtomicU64,
    pub cleanup_calls: AtomicU64,
    /// When set, every `fail` call errors as if the database were gone.
    pub fail_writes_down: AtomicBool,
    /// Number of upcoming `fail` calls that time out acquiring a connection.
    pub transient_fail_errors: AtomicU64,
}

impl FakeJobs {
    pub fn push(&self, job: Job) -> Uuid {
        let id = job.id;
        self.jobs.lock().unwrap().push(job);
        id
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .map(|j| j.status)
    }

    /// Reassign a job as if its claim had been reclaimed.
    pub fn steal(&self, job_id: Uuid) {
        if let Some(job) = self.jobs.lock().unwrap().iter_mut().find(|j| j.id == job_id) {
            job.status = JobStatus::Pending;
            job.worker_id = None;
        }
    }
}

#[async_trait]
impl JobRepository for FakeJobs {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid> {
        request.validate(usize::MAX)?;
        let mut job = sample_job(&request.pool, &request.job_type);
        job.payload = request.payload;
        job.priority = request.priority;
        job.max_retries = request.max_retries;
        Ok(self.push(job))
    }

    async fn claim(&self, pool: &str, worker_id: Uuid) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        let next = jobs
            .iter_mut()
            .filter(|j| j.pool == pool && j.status == JobStatus::Pending)
            .min_by_key(|j| (j.priority, j.created_at));
        Ok(next.map(|job| {
            job.status = JobStatus::Processing;
            job.worker_id = Some(worker_id);
            job.clone()
        }))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        result: Option<JsonValue>,
    ) -> Result<()> {
        // jsonb rejects the NUL escape.
        if let Some(value) = &result {
            if serde_json::to_string(value)?.contains("\\u0000") {
                return Err(Error::InvalidInput(
                    "unsupported Unicode escape sequence".into(),
                ));
            }
        }
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| {
                j.id == job_id && j.status == JobStatus::Processing && j.worker_id == Some(worker_id)
            })
            .ok_or(Error::StaleClaim { job_id, worker_id })?;
        job.status = JobStatus::Completed;
        job.worker_id = None;
        job.result = result.clone();
        self.completed
            .lock()
            .unwrap()
            .push((job_id, worker_id, result));
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, worker_id: Uuid, error: &str) -> Result<FailOutcome> {
        if self.fail_writes_down.load(Ordering::SeqCst) {
            return Err(Error::Internal("connection reset".into()));
        }
        if self
            .transient_fail_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        if error.contains('\0') {
            return Err(Error::InvalidInput("invalid byte sequence: 0x00".into()));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| {
                j.id == job_id && j.status == JobStatus::Processing && j.worker_id == Some(worker_id)
            })
            .ok_or(Error::StaleClaim { job_id, worker_id })?;
        job.retry_count += 1;
        job.worker_id = None;
        job.last_error = Some(error.to_string());
        self.failed
            .lock()
            .unwrap()
            .push((job_id, worker_id, error.to_string()));

        if job.retry_count <= job.max_retries {
            job.status = JobStatus::Pending;
            Ok(FailOutcome::Retrying {
                retry_count: job.retry_count,
                retry_at: None,
            })
        } else {
            job.status = JobStatus::Dead;
            Ok(FailOutcome::DeadLettered {
                retry_count: job.retry_count,
                dead_letter_id: Uuid::new_v4(),
            })
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| filter.pool.as_ref().map_or(true, |p| &j.pool == p))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect())
    }

    async fn queue_stats(&self, pool: Option<&str>) -> Result<QueueStats> {
        let jobs = self.jobs.lock().unwrap();
        let mut stats = QueueStats::default();
        for job in jobs.iter().filter(|j| pool.map_or(true, |p| j.pool == p)) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Scheduled => stats.scheduled += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn pending_count(&self, pool: &str) -> Result<i64> {
        Ok(self.queue_stats(Some(pool)).await?.pending)
    }

    async fn promote_due(&self) -> Result<u64> {
        self.promote_calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn cleanup_old_jobs(&self, _retention: Duration) -> Result<u64> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

// =============================================================================
// WORKERS
// =============================================================================

#[derive(Default)]
pub struct FakeWorkers {
    pub workers: Mutex<HashMap<Uuid, Worker>>,
    pub heartbeats: AtomicU64,
    pub deregistered: Mutex<Vec<Uuid>>,
    pub sweeps: AtomicU64,
    pub sweep_result: Mutex<StaleWorkerSweep>,
    pub sweep_error: Mutex<bool>,
}

impl FakeWorkers {
    pub fn state(&self, worker_id: Uuid) -> Option<WorkerState> {
        self.workers.lock().unwrap().get(&worker_id).map(|w| w.state)
    }
}

#[async_trait]
impl WorkerRepository for FakeWorkers {
    async fn register(&self, pool: &str, name: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.workers.lock().unwrap().insert(
            id,
            Worker {
                id,
                pool: pool.to_string(),
                name: name.to_string(),
                hostname: None,
                pid: None,
                state: WorkerState::Starting,
                jobs_completed: 0,
                jobs_failed: 0,
                current_job: None,
                started_at: now,
                last_heartbeat: now,
            },
        );
        Ok(id)
    }

    async fn heartbeat(&self, worker_id: Uuid, state: WorkerState) -> Result<()> {
        if matches!(state, WorkerState::Stopped | WorkerState::Error) {
            return Err(Error::InvalidInput(format!("heartbeat cannot set {}", state)));
        }
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .get_mut(&worker_id)
            .ok_or_else(|| Error::NotFound(format!("worker {}", worker_id)))?;
        worker.state = state;
        worker.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn deregister(&self, worker_id: Uuid) -> Result<()> {
        if let Some(worker) = self.workers.lock().unwrap().get_mut(&worker_id) {
            worker.state = WorkerState::Stopped;
        }
        self.deregistered.lock().unwrap().push(worker_id);
        Ok(())
    }

    async fn get(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        Ok(self.workers.lock().unwrap().get(&worker_id).cloned())
    }

    async fn list(&self, pool: Option<&str>) -> Result<Vec<Worker>> {
        Ok(self
            .workers
            .lock()
            .unwrap()
            .values()
            .filter(|w| pool.map_or(true, |p| w.pool == p))
            .cloned()
            .collect())
    }

    async fn cleanup_stale_workers(&self, _timeout: Duration) -> Result<StaleWorkerSweep> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        if *self.sweep_error.lock().unwrap() {
            return Err(Error::Internal("sweep failed".into()));
        }
        Ok(*self.sweep_result.lock().unwrap())
    }
}

// =============================================================================
// DEAD LETTERS, VECTORS, RATE LIMITS
// =============================================================================

#[derive(Default)]
pub struct FakeDeadLetters {
    pub purge_calls: AtomicU64,
}

#[async_trait]
impl DeadLetterRepository for FakeDeadLetters {
    async fn list(&self, _pool: Option<&str>, _limit: i64) -> Result<Vec<DeadLetter>> {
        Ok(Vec::new())
    }

    async fn get(&self, _id: Uuid) -> Result<Option<DeadLetter>> {
        Ok(None)
    }

    async fn count(&self, _pool: Option<&str>) -> Result<i64> {
        Ok(0)
    }

    async fn reprocess(&self, id: Uuid) -> Result<Uuid> {
        Err(Error::NotFound(format!("dead letter {}", id)))
    }

    async fn purge_reprocessed(&self, _retention: Duration) -> Result<u64> {
        self.purge_calls.fetch_add(1, Ordering::SeqCst);
        Ok(2)
    }
}

#[derive(Default)]
pub struct FakeVectors {
    pub collections: Mutex<Vec<VectorCollection>>,
    pub reindexed: Mutex<Vec<String>>,
    /// Collections whose reindex reports another rebuild in progress.
    pub locked: Mutex<Vec<String>>,
}

impl FakeVectors {
    pub fn add(&self, name: &str, index_type: IndexType, rows: i64, reindexed_at: Option<i64>) {
        self.collections.lock().unwrap().push(VectorCollection {
            name: name.to_string(),
            dimension: 3,
            metric: Default::default(),
            index_type,
            index_config: IndexConfig::default(),
            row_count: rows,
            reindex_row_count: reindexed_at,
            last_reindex_at: None,
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl VectorRepository for FakeVectors {
    async fn create_collection(
        &self,
        request: CreateCollectionRequest,
    ) -> Result<VectorCollection> {
        Err(Error::CollectionExists(request.name))
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        Err(Error::UnknownCollection(name.to_string()))
    }

    async fn get_collection(&self, name: &str) -> Result<Option<VectorCollection>> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn list_collections(&self) -> Result<Vec<VectorCollection>> {
        Ok(self.collections.lock().unwrap().clone())
    }

    async fn upsert(
        &self,
        collection: &str,
        _id: &str,
        _vector: &[f32],
        _payload: JsonValue,
    ) -> Result<()> {
        Err(Error::UnknownCollection(collection.to_string()))
    }

    async fn delete(&self, _collection: &str, _id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn search(
        &self,
        _collection: &str,
        _request: &SearchRequest,
    ) -> Result<Vec<SearchResult>> {
        Ok(Vec::new())
    }

    async fn count(&self, _collection: &str) -> Result<i64> {
        Ok(0)
    }

    async fn reindex(
        &self,
        collection: &str,
        _recall_target: Option<RecallTarget>,
    ) -> Result<IndexConfig> {
        if self.locked.lock().unwrap().iter().any(|c| c == collection) {
            return Err(Error::ReindexInProgress(collection.to_string()));
        }
        self.reindexed.lock().unwrap().push(collection.to_string());
        Ok(IndexConfig::default())
    }
}

#[derive(Default)]
pub struct FakeRateLimits {
    pub cleanup_calls: AtomicU64,
}

#[async_trait]
impl RateLimiter for FakeRateLimits {
    async fn check_rate_limit(
        &self,
        _key: &str,
        _limit: i64,
        _window_seconds: i64,
    ) -> Result<RateLimitDecision> {
        Ok(RateLimitDecision {
            allowed: true,
            count: 1,
            reset_at: Utc::now(),
        })
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }
}
