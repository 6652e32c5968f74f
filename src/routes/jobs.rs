use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::jobs;
use crate::error::ApiError;
use crate::models::job::{Job, JobListResponse, JobStatus};
use crate::models::operation;
use crate::services::queue::JobMessage;
use crate::services::session::CurrentUser;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
const STREAM_TICK: Duration = Duration::from_millis(500);

/// POST /api/v1/jobs — accept a multipart upload and enqueue it.
///
/// Order matters: everything is validated before the first side effect, then
/// blob put → row insert (PENDING) → QUEUED → queue publish. A failed
/// publish rolls the row back to PENDING and surfaces a 5xx.
pub async fn create_job(
    State(state): State<AppState>,
    CurrentUser(owner_id): CurrentUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let mut image: Option<(Vec<u8>, String, String)> = None;
    let mut operations_json: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("image") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| "upload".to_string());
                let declared_type = field.content_type().map(str::to_string);
                let data = field.bytes().await?;

                let content_type = resolve_content_type(declared_type.as_deref(), &filename)
                    .ok_or_else(|| {
                        ApiError::InvalidInput(
                            "invalid image type, must be JPEG, PNG, or GIF".to_string(),
                        )
                    })?;

                image = Some((data.to_vec(), filename, content_type));
            }
            Some("operations") => {
                operations_json = Some(field.text().await?);
            }
            _ => {}
        }
    }

    let (data, filename, content_type) =
        image.ok_or_else(|| ApiError::InvalidInput("image file is required".to_string()))?;
    if data.is_empty() {
        return Err(ApiError::InvalidInput("image file is empty".to_string()));
    }

    let operations = match operations_json.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => {
            let parsed = operation::parse_operations(raw)?;
            if parsed.is_empty() {
                operation::default_operations()
            } else {
                parsed
            }
        }
        None => operation::default_operations(),
    };

    let id = Uuid::new_v4();
    let original_key = format!("users/{owner_id}/original/{id}/{filename}");

    state
        .storage
        .upload(&original_key, &data, &content_type)
        .await?;

    let mut job = Job::new(
        owner_id,
        original_key,
        filename,
        content_type,
        data.len() as i64,
        operations.clone(),
    );
    job.id = id;

    jobs::create_job(&state.db, &job).await?;
    jobs::update_status(&state.db, job.id, JobStatus::Queued).await?;
    job.status = JobStatus::Queued;

    let message = JobMessage {
        job_id: job.id,
        operations,
    };
    if let Err(e) = state.queue.enqueue(&message).await {
        tracing::error!(job_id = %job.id, error = %e, "failed to enqueue job, reverting to pending");
        if let Err(revert) = jobs::update_status(&state.db, job.id, JobStatus::Pending).await {
            tracing::error!(job_id = %job.id, error = %revert, "failed to revert job to pending");
        }
        return Err(e.into());
    }

    metrics::counter!("pixelmill_jobs_created_total").increment(1);
    tracing::info!(
        job_id = %job.id,
        owner_id = %owner_id,
        file_size = job.file_size,
        operations = job.operations.len(),
        "job created and queued"
    );

    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// GET /api/v1/jobs — the owner's jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    CurrentUser(owner_id): CurrentUser,
    Query(params): Query<ListParams>,
) -> Result<Json<JobListResponse>, ApiError> {
    let (page, page_size) = clamp_paging(params.page, params.page_size);
    let (jobs, total) = jobs::list_jobs(&state.db, owner_id, page, page_size).await?;
    let total_pages = (total + page_size - 1) / page_size;

    Ok(Json(JobListResponse {
        jobs,
        total,
        page,
        page_size,
        total_pages,
    }))
}

/// GET /api/v1/jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = jobs::get_job(&state.db, id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    Ok(Json(job))
}

/// DELETE /api/v1/jobs/:id — cancel, permitted only from PENDING or QUEUED.
///
/// The queue message is left in place; the worker observes the canceled row
/// on dispatch and drops it.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cancelled = jobs::cancel_job(&state.db, id).await?;
    if cancelled == 0 {
        return match jobs::get_job(&state.db, id).await? {
            Some(_) => Err(ApiError::NotCancellable),
            None => Err(ApiError::NotFound("job")),
        };
    }

    metrics::counter!("pixelmill_jobs_canceled_total").increment(1);
    tracing::info!(job_id = %id, "job canceled");
    Ok(Json(json!({ "status": "canceled" })))
}

/// GET /api/v1/jobs/:id/stream — SSE progress stream.
///
/// Emits a snapshot immediately, then one per 500 ms tick until the job is
/// terminal (the terminal snapshot is sent before closing) or the client
/// goes away, which surfaces here as a failed channel send.
pub async fn stream_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<ReceiverStream<Result<Event, Infallible>>>, ApiError> {
    let job = jobs::get_job(&state.db, id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(16);

    tokio::spawn(async move {
        let initial_terminal = job.status.is_terminal();
        if tx.send(Ok(snapshot_event(&job))).await.is_err() {
            return;
        }
        if initial_terminal {
            return;
        }

        let mut ticker = tokio::time::interval(STREAM_TICK);
        ticker.tick().await; // consume the immediate first tick

        loop {
            ticker.tick().await;
            match jobs::get_job(&state.db, id).await {
                Ok(Some(job)) => {
                    let terminal = job.status.is_terminal();
                    if tx.send(Ok(snapshot_event(&job))).await.is_err() {
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "failed to read job during stream");
                    return;
                }
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn snapshot_event(job: &Job) -> Event {
    match serde_json::to_string(job) {
        Ok(payload) => Event::default().data(payload),
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "failed to serialize job snapshot");
            Event::default().data("{}")
        }
    }
}

/// Normalize paging: page below 1 becomes 1, page_size outside [1, 100]
/// falls back to the default of 20.
fn clamp_paging(page: Option<i64>, page_size: Option<i64>) -> (i64, i64) {
    let page = match page {
        Some(p) if p >= 1 => p,
        _ => 1,
    };
    let page_size = match page_size {
        Some(s) if (1..=MAX_PAGE_SIZE).contains(&s) => s,
        _ => DEFAULT_PAGE_SIZE,
    };
    (page, page_size)
}

/// Accepted upload content type, from the declared type or, failing that,
/// the filename extension.
fn resolve_content_type(declared: Option<&str>, filename: &str) -> Option<String> {
    if let Some(declared) = declared {
        if let Some(valid) = normalize_image_type(declared) {
            return Some(valid.to_string());
        }
    }
    detect_content_type(filename).map(str::to_string)
}

fn normalize_image_type(content_type: &str) -> Option<&'static str> {
    match content_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("image/jpeg"),
        "image/png" => Some("image/png"),
        "image/gif" => Some("image/gif"),
        _ => None,
    }
}

fn detect_content_type(filename: &str) -> Option<&'static str> {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        Some("image/jpeg")
    } else if lower.ends_with(".png") {
        Some("image/png")
    } else if lower.ends_with(".gif") {
        Some("image/gif")
    } else {
        None
    }
}
