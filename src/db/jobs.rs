//! Job repository.
//!
//! Every lifecycle transition is a single conditional UPDATE whose WHERE
//! clause enforces the precondition; callers inspect the affected-row count
//! to learn whether the transition happened. The row is the concurrency
//! unit; there is no read-then-write anywhere in this module.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::models::operation::Operation;

const JOB_COLUMNS: &str = "id, owner_id, status, original_key, processed_key, original_name, \
     content_type, file_size, operations, error, progress, worker_id, \
     created_at, updated_at, started_at, completed_at, processing_time_ms, delete_at";

/// Insert a new job row (status as carried by the struct, normally PENDING).
pub async fn create_job(pool: &PgPool, job: &Job) -> Result<(), sqlx::Error> {
    let operations = encode_operations(&job.operations)?;

    sqlx::query(
        "INSERT INTO jobs (id, owner_id, status, original_key, original_name, content_type, \
                           file_size, operations, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(job.id)
    .bind(job.owner_id)
    .bind(job.status.as_str())
    .bind(&job.original_key)
    .bind(&job.original_name)
    .bind(&job.content_type)
    .bind(job.file_size)
    .bind(operations)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a job by id.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| map_job(&r)).transpose()
}

/// Paginated listing of an owner's jobs, newest first. Returns the page and
/// the owner's total job count.
pub async fn list_jobs(
    pool: &PgPool,
    owner_id: Uuid,
    page: i64,
    page_size: i64,
) -> Result<(Vec<Job>, i64), sqlx::Error> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE owner_id = $1")
        .bind(owner_id)
        .fetch_one(pool)
        .await?;

    let offset = (page - 1) * page_size;
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE owner_id = $1 \
         ORDER BY created_at DESC \
         LIMIT $2 OFFSET $3"
    ))
    .bind(owner_id)
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let jobs = rows.iter().map(map_job).collect::<Result<Vec<_>, _>>()?;
    Ok((jobs, total))
}

/// Unconditional status write. Used only by the acceptor on a row it just
/// inserted (PENDING → QUEUED, and the rollback to PENDING when the enqueue
/// fails); workers go through the conditional transitions below.
pub async fn update_status(
    pool: &PgPool,
    id: Uuid,
    status: JobStatus,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE jobs SET status = $1 WHERE id = $2")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Monotonic progress write: replayed work can never move progress backwards.
pub async fn update_progress(pool: &PgPool, id: Uuid, progress: i32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET progress = GREATEST(progress, $1) WHERE id = $2")
        .bind(progress)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// QUEUED → PROCESSING (also PROCESSING → PROCESSING for crash replay by the
/// same consumer). Records the claiming worker and the start time. Returns 0
/// when the row is gone, terminal, or still PENDING.
pub async fn start_processing(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'processing', worker_id = $2, started_at = NOW() \
         WHERE id = $1 AND status IN ('queued', 'processing')",
    )
    .bind(id)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// PROCESSING → COMPLETED. Sets progress to 100, stamps the completion time,
/// derives `processing_time_ms`, and schedules retention.
pub async fn complete_job(
    pool: &PgPool,
    id: Uuid,
    processed_key: &str,
    retention_hours: i32,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'completed', \
             processed_key = $2, \
             progress = 100, \
             completed_at = NOW(), \
             processing_time_ms = CAST(EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000 AS BIGINT), \
             delete_at = NOW() + make_interval(hours => $3) \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(processed_key)
    .bind(retention_hours)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// PROCESSING → FAILED. Failure is terminal; failed rows get the same
/// retention window as completed ones.
pub async fn fail_job(
    pool: &PgPool,
    id: Uuid,
    error: &str,
    retention_hours: i32,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'failed', \
             error = $2, \
             completed_at = NOW(), \
             processing_time_ms = CAST(EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000 AS BIGINT), \
             delete_at = NOW() + make_interval(hours => $3) \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(error)
    .bind(retention_hours)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// {PENDING, QUEUED} → CANCELLED. Returns 0 when the job is already being
/// processed or is terminal; the caller maps that to `NotCancellable`.
pub async fn cancel_job(pool: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'canceled' \
         WHERE id = $1 AND status IN ('pending', 'queued')",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Terminal rows whose retention window has elapsed, oldest first.
pub async fn jobs_to_cleanup(pool: &PgPool, limit: i64) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE delete_at IS NOT NULL AND delete_at < NOW() \
         ORDER BY delete_at ASC \
         LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_job).collect()
}

/// PENDING rows older than `max_age_hours`: orphans of the narrow window
/// between row insert and queue publish when the acceptor crashed in between.
pub async fn stale_pending_jobs(
    pool: &PgPool,
    max_age_hours: i64,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE status = 'pending' AND created_at < NOW() - make_interval(hours => $1) \
         ORDER BY created_at ASC \
         LIMIT $2"
    ))
    .bind(max_age_hours as i32)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_job).collect()
}

/// Remove a job row. Returns the affected-row count so a concurrent sweep
/// that already deleted the row reads as a no-op rather than an error.
pub async fn delete_job(pool: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

fn encode_operations(operations: &[Operation]) -> Result<String, sqlx::Error> {
    serde_json::to_string(operations).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

fn map_job(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_db(&status_str).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "status".into(),
        source: format!("unknown job status: {status_str}").into(),
    })?;

    let operations_json: String = row.try_get("operations")?;
    let operations: Vec<Operation> =
        serde_json::from_str(&operations_json).map_err(|e| sqlx::Error::ColumnDecode {
            index: "operations".into(),
            source: Box::new(e),
        })?;

    Ok(Job {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        status,
        original_key: row.try_get("original_key")?,
        processed_key: row.try_get("processed_key")?,
        original_name: row.try_get("original_name")?,
        content_type: row.try_get("content_type")?,
        file_size: row.try_get("file_size")?,
        operations,
        error: row.try_get::<Option<String>, _>("error")?.unwrap_or_default(),
        progress: row.try_get("progress")?,
        worker_id: row.try_get("worker_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        delete_at: row.try_get("delete_at")?,
    })
}
