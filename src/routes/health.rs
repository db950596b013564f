use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::broker::{ManagementQueue, QueueKey};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub state_store: ComponentHealth,
    pub queue_store: ComponentHealth,
    pub model_runtime: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

fn ok(latency_ms: u64) -> ComponentHealth {
    ComponentHealth {
        status: "ok".to_string(),
        latency_ms: Some(latency_ms),
    }
}

fn failed() -> ComponentHealth {
    ComponentHealth {
        status: "error".to_string(),
        latency_ms: None,
    }
}

/// GET /health — dependency status for the state store, queue store, and
/// model runtime.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let db_check = match sqlx::query("SELECT 1").execute(state.store.pool()).await {
        Ok(_) => ok(start.elapsed().as_millis() as u64),
        Err(_) => failed(),
    };

    let queue_start = std::time::Instant::now();
    let queue_check = match state
        .broker
        .depth(QueueKey::Management(ManagementQueue::BatchCompletion))
        .await
    {
        Ok(_) => ok(queue_start.elapsed().as_millis() as u64),
        Err(_) => failed(),
    };

    let model_start = std::time::Instant::now();
    let model_check = if state.model.is_ready().await {
        ok(model_start.elapsed().as_millis() as u64)
    } else {
        failed()
    };

    let all_healthy = [&db_check, &queue_check, &model_check]
        .iter()
        .all(|c| c.status == "ok");
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
            state_store: db_check,
            queue_store: queue_check,
            model_runtime: model_check,
        },
    };

    (status_code, Json(response))
}
