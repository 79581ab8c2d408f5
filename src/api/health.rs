use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::state::AppState;

/// 200 while at least one configured device responds; 503 otherwise.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health();
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
