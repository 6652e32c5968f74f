use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::services::queue::QueueStats;

/// GET /api/v1/stats/queue — stream length plus consumer-group pending and
/// consumer counts. Observational; the autoscaler reads this.
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    let stats = state
        .queue
        .stats(&state.config.queue_consumer_group)
        .await?;
    Ok(Json(stats))
}
