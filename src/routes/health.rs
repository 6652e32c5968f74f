use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::db;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub storage: ComponentHealth,
    pub queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

fn component(result: Result<(), String>, latency_ms: u64) -> ComponentHealth {
    match result {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(latency_ms),
        },
        Err(error) => {
            tracing::warn!(error = %error, "health check failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    }
}

/// GET /api/v1/health — component health roll-up. 503 when any dependency
/// is down.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let database = component(
        db::health(&state.db).await.map_err(|e| e.to_string()),
        start.elapsed().as_millis() as u64,
    );

    let start = std::time::Instant::now();
    let storage = component(
        state.storage.health_check().await.map_err(|e| e.to_string()),
        start.elapsed().as_millis() as u64,
    );

    let start = std::time::Instant::now();
    let queue = component(
        state.queue.health_check().await.map_err(|e| e.to_string()),
        start.elapsed().as_millis() as u64,
    );

    let all_healthy =
        database.status == "ok" && storage.status == "ok" && queue.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database,
            storage,
            queue,
        },
    };

    (status_code, Json(response))
}
