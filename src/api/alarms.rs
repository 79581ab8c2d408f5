//! Alarm query endpoint.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};

use crate::alarms::AlarmQuery;
use crate::state::AppState;

/// `GET /alarms?type=&severity=&active=&limit=&offset=`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<AlarmQuery>,
) -> impl IntoResponse {
    Json(state.alarms.query(&query))
}
