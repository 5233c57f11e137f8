//! Integration tests for failure routing and the dead-letter store.
//!
//! **IMPORTANT**: These tests require a fully migrated PostgreSQL database.

use std::time::Duration;

use keel_db::test_fixtures::TestDatabase;
use keel_db::{
    DeadLetterRepository, EnqueueRequest, Error, FailOutcome, JobRepository, JobStatus,
    QueueConfig, RetryPolicy, WorkerRepository,
};
use serde_json::json;

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_exhausted_job_is_dead_lettered_and_reprocessed() {
    let mut test_db =
        TestDatabase::with_queue_config(QueueConfig::default().with_retry(RetryPolicy::immediate()))
            .await;
    let pool = test_db.pool_name("dlq");
    let db = test_db.db.clone();

    let job_id = db
        .jobs
        .enqueue(
            EnqueueRequest::new(&pool, "flaky", json!({"doc": 7}))
                .with_priority(2)
                .with_max_retries(1),
        )
        .await
        .unwrap();
    let worker = db.workers.register(&pool, "w-dlq").await.unwrap();

    db.jobs.claim(&pool, worker).await.unwrap().unwrap();
    let outcome = db.jobs.fail(job_id, worker, "first").await.unwrap();
    assert_eq!(
        outcome,
        FailOutcome::Retrying {
            retry_count: 1,
            retry_at: None
        }
    );
    let job = db.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    db.jobs.claim(&pool, worker).await.unwrap().unwrap();
    let outcome = db.jobs.fail(job_id, worker, "second").await.unwrap();
    let FailOutcome::DeadLettered {
        retry_count,
        dead_letter_id,
    } = outcome
    else {
        panic!("expected dead letter, got {:?}", outcome);
    };
    assert_eq!(retry_count, 2);

    let job = db.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert!(job.completed_at.is_some());
    assert_eq!(job.last_error.as_deref(), Some("second"));

    let letter = db.dead_letters.get(dead_letter_id).await.unwrap().unwrap();
    assert_eq!(letter.job_id, job_id);
    assert_eq!(letter.payload, json!({"doc": 7}));
    assert_eq!(letter.priority, 2);
    assert_eq!(letter.retry_count, 2);
    assert_eq!(letter.error.as_deref(), Some("second"));
    assert!(!letter.is_reprocessed());
    assert_eq!(db.dead_letters.count(Some(&pool)).await.unwrap(), 1);
    assert_eq!(db.dead_letters.list(Some(&pool), 10).await.unwrap().len(), 1);

    let worker_row = db.workers.get(worker).await.unwrap().unwrap();
    assert_eq!(worker_row.jobs_failed, 2);

    // Reprocessing enqueues a fresh job with the snapshot's settings.
    let new_id = db.dead_letters.reprocess(dead_letter_id).await.unwrap();
    assert_ne!(new_id, job_id);
    let fresh = db.jobs.get(new_id).await.unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Pending);
    assert_eq!(fresh.retry_count, 0);
    assert_eq!(fresh.max_retries, 1);
    assert_eq!(fresh.priority, 2);
    assert_eq!(fresh.payload, json!({"doc": 7}));

    let letter = db.dead_letters.get(dead_letter_id).await.unwrap().unwrap();
    assert_eq!(letter.reprocessed_job_id, Some(new_id));

    let err = db.dead_letters.reprocess(dead_letter_id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_backoff_schedules_retry() {
    let mut test_db = TestDatabase::with_queue_config(
        QueueConfig::default().with_retry(RetryPolicy::fixed(Duration::from_secs(60))),
    )
    .await;
    let pool = test_db.pool_name("backoff");
    let db = test_db.db.clone();

    let job_id = db
        .jobs
        .enqueue(EnqueueRequest::new(&pool, "t", json!({})))
        .await
        .unwrap();
    let worker = db.workers.register(&pool, "w-backoff").await.unwrap();
    db.jobs.claim(&pool, worker).await.unwrap().unwrap();

    let outcome = db.jobs.fail(job_id, worker, "boom").await.unwrap();
    let FailOutcome::Retrying {
        retry_count,
        retry_at: Some(retry_at),
    } = outcome
    else {
        panic!("expected scheduled retry, got {:?}", outcome);
    };
    assert_eq!(retry_count, 1);

    let job = db.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.scheduled_at, Some(retry_at));
    assert!(retry_at > job.created_at + chrono::Duration::seconds(50));

    // Not claimable before the delay elapses.
    assert!(db.jobs.claim(&pool, worker).await.unwrap().is_none());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_zero_retries_dead_letters_on_first_failure() {
    let mut test_db = TestDatabase::new().await;
    let pool = test_db.pool_name("noretry");
    let db = test_db.db.clone();

    let job_id = db
        .jobs
        .enqueue(EnqueueRequest::new(&pool, "t", json!({})).with_max_retries(0))
        .await
        .unwrap();
    let worker = db.workers.register(&pool, "w-noretry").await.unwrap();
    db.jobs.claim(&pool, worker).await.unwrap().unwrap();

    let outcome = db.jobs.fail(job_id, worker, "fatal").await.unwrap();
    assert!(matches!(outcome, FailOutcome::DeadLettered { retry_count: 1, .. }));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_reprocess_unknown_dead_letter() {
    let test_db = TestDatabase::new().await;
    let err = test_db
        .db
        .dead_letters
        .reprocess(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    test_db.cleanup().await;
}
