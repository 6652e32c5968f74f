//! Integration tests against live infrastructure.
//!
//! These exercise the job state machine, the queue, and the sweeper against
//! real PostgreSQL / Redis / MinIO instances configured via environment
//! variables. Run with:
//!
//!     cargo test --test integration_test -- --ignored

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use pixelmill::config::AppConfig;
use pixelmill::db::{self, jobs};
use pixelmill::models::job::{Job, JobStatus};
use pixelmill::models::operation::{default_operations, Operation};
use pixelmill::services::queue::{JobConsumer, JobMessage, JobQueue};
use pixelmill::services::storage::ObjectStorage;
use pixelmill::services::sweeper::Sweeper;

async fn setup() -> (AppConfig, sqlx::PgPool, ObjectStorage) {
    let config = AppConfig::from_env().expect("Failed to load config");

    let pool = db::init_pool(&config.database_url, 5)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");

    let storage = ObjectStorage::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize storage");
    storage.ensure_bucket().await.expect("Failed to ensure bucket");

    (config, pool, storage)
}

fn test_job(owner: Uuid) -> Job {
    let id = Uuid::new_v4();
    Job::new(
        owner,
        format!("users/{owner}/original/{id}/test.png"),
        "test.png".to_string(),
        "image/png".to_string(),
        2048,
        default_operations(),
    )
}

#[tokio::test]
#[ignore]
async fn job_lifecycle_happy_path() {
    let (_, pool, _) = setup().await;
    let job = test_job(Uuid::nil());

    jobs::create_job(&pool, &job).await.expect("create");

    let stored = jobs::get_job(&pool, job.id)
        .await
        .expect("get")
        .expect("job exists");
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.operations, default_operations());
    assert!(stored.processed_key.is_empty());

    assert_eq!(
        jobs::update_status(&pool, job.id, JobStatus::Queued).await.expect("queue"),
        1
    );

    let claimed = jobs::start_processing(&pool, job.id, "worker-test1").await.expect("claim");
    assert_eq!(claimed, 1);

    let processing = jobs::get_job(&pool, job.id).await.expect("get").expect("exists");
    assert_eq!(processing.status, JobStatus::Processing);
    assert_eq!(processing.worker_id.as_deref(), Some("worker-test1"));
    assert!(processing.started_at.is_some());
    assert!(processing.processed_key.is_empty());

    let processed_key = format!("processed/{}/test.png", job.id);
    let completed = jobs::complete_job(&pool, job.id, &processed_key, 1).await.expect("complete");
    assert_eq!(completed, 1);

    let done = jobs::get_job(&pool, job.id).await.expect("get").expect("exists");
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.processed_key, processed_key);
    assert!(done.completed_at.is_some());
    assert!(done.processing_time_ms.is_some());
    assert!(done.delete_at.expect("delete_at set") > done.completed_at.expect("completed_at set"));

    jobs::delete_job(&pool, job.id).await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn cancel_is_conditional_on_pre_dispatch_states() {
    let (_, pool, _) = setup().await;

    // Queued jobs cancel.
    let job = test_job(Uuid::nil());
    jobs::create_job(&pool, &job).await.expect("create");
    jobs::update_status(&pool, job.id, JobStatus::Queued).await.expect("queue");
    assert_eq!(jobs::cancel_job(&pool, job.id).await.expect("cancel"), 1);
    let canceled = jobs::get_job(&pool, job.id).await.expect("get").expect("exists");
    assert_eq!(canceled.status, JobStatus::Cancelled);

    // A canceled job cannot be claimed.
    assert_eq!(
        jobs::start_processing(&pool, job.id, "worker-test1").await.expect("claim attempt"),
        0
    );
    jobs::delete_job(&pool, job.id).await.expect("cleanup");

    // Processing and terminal jobs do not cancel.
    let job = test_job(Uuid::nil());
    jobs::create_job(&pool, &job).await.expect("create");
    jobs::update_status(&pool, job.id, JobStatus::Queued).await.expect("queue");
    jobs::start_processing(&pool, job.id, "worker-test1").await.expect("claim");
    assert_eq!(jobs::cancel_job(&pool, job.id).await.expect("cancel attempt"), 0);

    jobs::complete_job(&pool, job.id, "processed/x", 1).await.expect("complete");
    assert_eq!(jobs::cancel_job(&pool, job.id).await.expect("cancel attempt"), 0);
    jobs::delete_job(&pool, job.id).await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn replay_keeps_progress_monotonic() {
    let (_, pool, _) = setup().await;
    let job = test_job(Uuid::nil());
    jobs::create_job(&pool, &job).await.expect("create");
    jobs::update_status(&pool, job.id, JobStatus::Queued).await.expect("queue");
    jobs::start_processing(&pool, job.id, "worker-test1").await.expect("claim");
    jobs::update_progress(&pool, job.id, 90).await.expect("progress");

    // Crash replay: the same worker re-claims and restarts its milestones.
    assert_eq!(
        jobs::start_processing(&pool, job.id, "worker-test1").await.expect("re-claim"),
        1
    );
    jobs::update_progress(&pool, job.id, 10).await.expect("progress");

    let stored = jobs::get_job(&pool, job.id).await.expect("get").expect("exists");
    assert_eq!(stored.progress, 90);

    jobs::delete_job(&pool, job.id).await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn failed_jobs_are_terminal_with_retention() {
    let (_, pool, _) = setup().await;
    let job = test_job(Uuid::nil());
    jobs::create_job(&pool, &job).await.expect("create");
    jobs::update_status(&pool, job.id, JobStatus::Queued).await.expect("queue");
    jobs::start_processing(&pool, job.id, "worker-test1").await.expect("claim");

    jobs::fail_job(&pool, job.id, "failed to process image: bad bytes", 1)
        .await
        .expect("fail");

    let failed = jobs::get_job(&pool, job.id).await.expect("get").expect("exists");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error, "failed to process image: bad bytes");
    assert!(failed.completed_at.is_some());
    assert!(failed.delete_at.is_some());
    assert!(failed.processed_key.is_empty());

    jobs::delete_job(&pool, job.id).await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn queue_round_trip_with_consumer_group() {
    let (config, _, _) = setup().await;

    let stream = format!("test-jobs-{}", Uuid::new_v4().simple());
    let queue = JobQueue::new(&config.redis_url, &stream).expect("queue");
    let consumer = JobConsumer::new(
        &config.redis_url,
        &stream,
        "test-workers",
        "worker-inttest",
        Duration::from_millis(200),
    )
    .expect("consumer");
    consumer.ensure_group().await.expect("ensure group");
    consumer.ensure_group().await.expect("ensure group is idempotent");

    let msg = JobMessage {
        job_id: Uuid::new_v4(),
        operations: vec![Operation::Resize { width: 800, height: 0 }],
    };
    queue.enqueue(&msg).await.expect("enqueue");

    let stats = queue.stats("test-workers").await.expect("stats");
    assert_eq!(stats.stream_length, 1);

    let delivered = consumer.consume().await.expect("consume").expect("message available");
    assert_eq!(delivered.job.job_id, msg.job_id);
    assert_eq!(delivered.job.operations, msg.operations);

    // Unacked messages replay to the same consumer.
    let replayed = consumer.consume().await.expect("consume").expect("pending replay");
    assert_eq!(replayed.id, delivered.id);

    consumer.ack(&delivered.id).await.expect("ack");
    let after_ack = consumer.consume().await.expect("consume");
    assert!(after_ack.is_none());

    let stats = queue.stats("test-workers").await.expect("stats");
    assert_eq!(stats.pending_count, 0);
}

#[tokio::test]
#[ignore]
async fn sweeper_reclaims_expired_jobs_idempotently() {
    let (config, pool, storage) = setup().await;
    let storage = Arc::new(storage);

    let original_key = format!("sweep-test/original-{}.png", Uuid::new_v4());
    let processed_key = format!("sweep-test/processed-{}.png", Uuid::new_v4());
    storage.upload(&original_key, b"original bytes", "image/png").await.expect("upload");
    storage.upload(&processed_key, b"processed bytes", "image/png").await.expect("upload");

    let mut job = test_job(Uuid::nil());
    job.original_key = original_key.clone();
    jobs::create_job(&pool, &job).await.expect("create");
    jobs::update_status(&pool, job.id, JobStatus::Queued).await.expect("queue");
    jobs::start_processing(&pool, job.id, "worker-test1").await.expect("claim");
    jobs::complete_job(&pool, job.id, &processed_key, 1).await.expect("complete");

    sqlx::query("UPDATE jobs SET delete_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .expect("age the row");

    let sweeper = Sweeper::new(
        pool.clone(),
        storage.clone(),
        Duration::from_secs(config.sweeper_interval_secs),
        10,
        config.pending_max_age_hours,
    );

    sweeper.sweep().await.expect("first sweep");

    assert!(jobs::get_job(&pool, job.id).await.expect("get").is_none());
    assert!(storage.download(&original_key).await.is_err());
    assert!(storage.download(&processed_key).await.is_err());

    // Second pass over the same (now absent) row is a no-op.
    sweeper.sweep().await.expect("second sweep");
}

#[tokio::test]
#[ignore]
async fn sweeper_reaps_orphaned_pending_rows() {
    let (config, pool, storage) = setup().await;
    let storage = Arc::new(storage);

    let job = test_job(Uuid::nil());
    jobs::create_job(&pool, &job).await.expect("create");
    sqlx::query("UPDATE jobs SET created_at = NOW() - INTERVAL '48 hours' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .expect("age the row");

    let sweeper = Sweeper::new(
        pool.clone(),
        storage,
        Duration::from_secs(config.sweeper_interval_secs),
        10,
        24,
    );
    sweeper.sweep().await.expect("sweep");

    assert!(jobs::get_job(&pool, job.id).await.expect("get").is_none());
}

#[tokio::test]
#[ignore]
async fn listing_is_owner_scoped_and_paginated() {
    let (_, pool, _) = setup().await;
    let owner = Uuid::new_v4();

    let mut created = Vec::new();
    for _ in 0..3 {
        let job = test_job(owner);
        jobs::create_job(&pool, &job).await.expect("create");
        created.push(job.id);
    }

    let (page, total) = jobs::list_jobs(&pool, owner, 1, 2).await.expect("list");
    assert_eq!(total, 3);
    assert_eq!(page.len(), 2);

    let (rest, _) = jobs::list_jobs(&pool, owner, 2, 2).await.expect("list");
    assert_eq!(rest.len(), 1);

    let (other, other_total) = jobs::list_jobs(&pool, Uuid::new_v4(), 1, 20).await.expect("list");
    assert_eq!(other_total, 0);
    assert!(other.is_empty());

    for id in created {
        jobs::delete_job(&pool, id).await.expect("cleanup");
    }
}
