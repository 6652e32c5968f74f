use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::jobs;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ImageParams {
    #[serde(default)]
    pub original: bool,
}

/// GET /api/v1/images/:id — download the processed artifact, or the original
/// when `?original=true` or while no artifact exists yet.
pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ImageParams>,
) -> Result<Response, ApiError> {
    let job = jobs::get_job(&state.db, id)
        .await?
        .ok_or(ApiError::NotFound("image"))?;

    let key = if params.original || job.processed_key.is_empty() {
        &job.original_key
    } else {
        &job.processed_key
    };

    let data = state.storage.download(key).await?;

    Ok(([(header::CONTENT_TYPE, job.content_type)], data).into_response())
}
