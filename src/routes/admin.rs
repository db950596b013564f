use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct ReloadResponse {
    pub swapped: bool,
    pub version: Option<String>,
    pub changed: Vec<String>,
    pub failed: Vec<ReloadFailure>,
}

#[derive(Serialize)]
pub struct ReloadFailure {
    pub path: String,
    pub reason: String,
}

/// POST /admin/reload — force a profile re-read. A failed validation
/// leaves the active set untouched and reports why.
pub async fn reload_profiles(State(state): State<AppState>) -> (StatusCode, Json<ReloadResponse>) {
    let report = state.profiles.reload().await;
    let status = if report.failed.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    let response = ReloadResponse {
        swapped: report.swapped,
        version: report.version,
        changed: report.changed,
        failed: report
            .failed
            .into_iter()
            .map(|(path, reason)| ReloadFailure { path, reason })
            .collect(),
    };
    (status, Json(response))
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub requested: bool,
}

/// POST /admin/processes/:process_id/cancel — request cooperative
/// cancellation; in-flight tasks finish their current model call.
pub async fn cancel_process(
    State(state): State<AppState>,
    Path(process_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, StatusCode> {
    match state.store.request_cancel(process_id).await {
        Ok(requested) => Ok(Json(CancelResponse { requested })),
        Err(e) => {
            tracing::error!(error = %e, "cancel request failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
