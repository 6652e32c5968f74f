use axum::{routing::get, Json, Router};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pixelmill::config::AppConfig;
use pixelmill::db::{self, jobs};
use pixelmill::models::job::JobStatus;
use pixelmill::services::{
    processor,
    queue::{JobConsumer, QueueMessage},
    storage::ObjectStorage,
};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

type ProcessResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Everything a dispatch task needs; the clients are all task-safe and
/// shared, there is no other state between tasks.
struct WorkerContext {
    id: String,
    db: PgPool,
    storage: Arc<ObjectStorage>,
    consumer: JobConsumer,
    retention_hours: i32,
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // One consumer identity per process; all dispatch tasks share it so a
    // restarted pod resumes its own unacknowledged messages.
    let worker_id = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
    tracing::info!(worker_id = %worker_id, "starting image processing worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.database_max_conn)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing object storage client");
    let storage = Arc::new(
        ObjectStorage::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
        )
        .expect("Failed to initialize object storage"),
    );

    tracing::info!("Connecting to Redis job queue");
    let poll_timeout = Duration::from_millis(config.worker_poll_timeout_ms);
    let bootstrap_consumer = JobConsumer::new(
        &config.redis_url,
        &config.queue_stream_name,
        &config.queue_consumer_group,
        &worker_id,
        poll_timeout,
    )
    .expect("Failed to initialize queue consumer");
    bootstrap_consumer
        .ensure_group()
        .await
        .expect("Failed to ensure consumer group");

    let shutdown = CancellationToken::new();

    // Signal handling: stop consuming, let in-flight jobs finish.
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install signal handler");
            tracing::info!("shutdown signal received, draining in-flight jobs");
            token.cancel();
        });
    }

    // Liveness endpoints for the orchestrator
    tokio::spawn(health_server(config.worker_health_port));

    let mut handles = Vec::with_capacity(config.worker_concurrency);
    for task_num in 0..config.worker_concurrency {
        let ctx = WorkerContext {
            id: worker_id.clone(),
            db: db_pool.clone(),
            storage: storage.clone(),
            consumer: JobConsumer::new(
                &config.redis_url,
                &config.queue_stream_name,
                &config.queue_consumer_group,
                &worker_id,
                poll_timeout,
            )
            .expect("Failed to initialize queue consumer"),
            retention_hours: config.retention_hours,
        };
        let token = shutdown.clone();
        handles.push(tokio::spawn(dispatch_loop(ctx, task_num, token)));
    }

    tracing::info!(concurrency = config.worker_concurrency, "worker started");

    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("worker stopped");
}

/// Poll, process, acknowledge, until shutdown. A message is acknowledged on
/// every outcome where the job row ended up terminal (or was gone/canceled);
/// when a transport failure prevented recording a terminal state the message
/// is left pending so this consumer replays it.
async fn dispatch_loop(ctx: WorkerContext, task_num: usize, shutdown: CancellationToken) {
    loop {
        let consumed = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(task_num, "dispatch task stopping");
                return;
            }
            consumed = ctx.consumer.consume() => consumed,
        };

        let msg = match consumed {
            Ok(Some(msg)) => msg,
            Ok(None) => continue, // poll timeout, nothing queued
            Err(e) => {
                tracing::error!(task_num, error = %e, "failed to consume message");
                sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        match process_message(&ctx, &msg).await {
            Ok(()) => {
                if let Err(e) = ctx.consumer.ack(&msg.id).await {
                    tracing::error!(message_id = %msg.id, error = %e, "failed to acknowledge message");
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %msg.job.job_id,
                    message_id = %msg.id,
                    error = %e,
                    "processing interrupted, leaving message pending for replay"
                );
                sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

/// Run one job end-to-end.
///
/// Returns Ok when the message can be acknowledged: the row reached a
/// terminal state, or it was gone/canceled/unclaimable. Errors mean no
/// terminal state was recorded and the message must stay pending.
async fn process_message(ctx: &WorkerContext, msg: &QueueMessage) -> ProcessResult {
    let job_id = msg.job.job_id;

    let job = match jobs::get_job(&ctx.db, job_id).await? {
        Some(job) => job,
        None => {
            tracing::warn!(job_id = %job_id, "job row not found, dropping message");
            return Ok(());
        }
    };

    if job.status == JobStatus::Cancelled {
        tracing::info!(job_id = %job_id, "job canceled, dropping message");
        return Ok(());
    }
    if job.status.is_terminal() {
        tracing::info!(job_id = %job_id, status = job.status.as_str(), "job already terminal, dropping message");
        return Ok(());
    }

    let claimed = jobs::start_processing(&ctx.db, job_id, &ctx.id).await?;
    if claimed == 0 {
        tracing::warn!(job_id = %job_id, status = job.status.as_str(), "job not claimable, dropping message");
        return Ok(());
    }

    tracing::info!(
        job_id = %job_id,
        operations = msg.job.operations.len(),
        "processing job"
    );
    let started = std::time::Instant::now();

    if let Err(e) = jobs::update_progress(&ctx.db, job_id, 10).await {
        tracing::warn!(job_id = %job_id, error = %e, "failed to update progress");
    }

    let original = match ctx.storage.download(&job.original_key).await {
        Ok(data) => data,
        Err(e) => {
            return fail_job(ctx, job_id, &format!("failed to download original: {e}")).await;
        }
    };

    if let Err(e) = jobs::update_progress(&ctx.db, job_id, 25).await {
        tracing::warn!(job_id = %job_id, error = %e, "failed to update progress");
    }

    // The message's operations are authoritative for what was queued; the
    // row only carries a snapshot.
    let processed = match processor::process(&original, &job.content_type, &msg.job.operations) {
        Ok(result) => result,
        Err(e) => {
            return fail_job(ctx, job_id, &format!("failed to process image: {e}")).await;
        }
    };

    if let Err(e) = jobs::update_progress(&ctx.db, job_id, 75).await {
        tracing::warn!(job_id = %job_id, error = %e, "failed to update progress");
    }

    // Key depends only on the job, so a crash replay overwrites in place.
    let processed_key = format!("processed/{}/{}", job_id, job.original_name);
    if let Err(e) = ctx
        .storage
        .upload(&processed_key, &processed.data, &processed.content_type)
        .await
    {
        return fail_job(ctx, job_id, &format!("failed to upload artifact: {e}")).await;
    }

    if let Err(e) = jobs::update_progress(&ctx.db, job_id, 90).await {
        tracing::warn!(job_id = %job_id, error = %e, "failed to update progress");
    }

    let completed =
        jobs::complete_job(&ctx.db, job_id, &processed_key, ctx.retention_hours).await?;
    if completed == 0 {
        tracing::warn!(job_id = %job_id, "job left processing state before completion");
        return Ok(());
    }

    tracing::info!(
        job_id = %job_id,
        processed_key = %processed_key,
        width = processed.width,
        height = processed.height,
        duration_ms = started.elapsed().as_millis() as u64,
        "job completed"
    );

    Ok(())
}

/// Record a terminal failure. Transform failures are not retried; the user
/// re-submits instead.
async fn fail_job(ctx: &WorkerContext, job_id: Uuid, reason: &str) -> ProcessResult {
    tracing::error!(job_id = %job_id, reason, "job failed");
    jobs::fail_job(&ctx.db, job_id, reason, ctx.retention_hours).await?;
    Ok(())
}

async fn health_server(port: u16) {
    let app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy"})) }))
        .route("/ready", get(|| async { Json(json!({"status": "ready"})) }));

    let addr = format!("0.0.0.0:{port}");
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            tracing::info!(addr = %addr, "health server listening");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "health server error");
            }
        }
        Err(e) => tracing::error!(addr = %addr, error = %e, "failed to bind health server"),
    }
}
