//! Wind farm endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::error::EmsError;
use crate::state::AppState;

use super::error::ApiError;

pub async fn summary(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.windfarm.summary().await)
}

pub async fn get_unit(
    State(state): State<AppState>,
    Path(id): Path<u16>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.windfarm.get(id).ok_or(EmsError::NotFound(id))?;
    Ok(Json(service.telemetry().await))
}

#[derive(Debug, Deserialize)]
pub struct PowerLimitRequest {
    /// Limit for one unit, or all units when absent.
    #[serde(default)]
    pub id: Option<u16>,
    pub power: f64,
}

pub async fn set_power_limit(
    State(state): State<AppState>,
    Json(req): Json<PowerLimitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match req.id {
        Some(id) => {
            let service = state.windfarm.get(id).ok_or(EmsError::NotFound(id))?;
            service.set_power_limit(req.power).await?;
            Ok(StatusCode::OK.into_response())
        }
        None => {
            let status = state.windfarm.set_power_limit_all(req.power).await;
            Ok((StatusCode::OK, Json(status)).into_response())
        }
    }
}
