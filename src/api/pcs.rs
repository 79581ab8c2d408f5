//! Power conversion unit endpoints.

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

pub async fn get_unit(
    State(state): State<AppState>,
    Path(id): Path<u16>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.pcs.get(id).ok_or(EmsError::NotFound(id))?;
    Ok(Json(service.telemetry().await))
}

pub async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<u16>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.pcs.get(id).ok_or(EmsError::NotFound(id))?;
    Ok(Json(service.command_state().await))
}

#[derive(Debug, Deserialize)]
pub struct StartStopRequest {
    pub id: u16,
    pub start: bool,
}

pub async fn start_stop(
    State(state): State<AppState>,
    Json(req): Json<StartStopRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.pcs.get(req.id).ok_or(EmsError::NotFound(req.id))?;
    service.start_stop(req.start).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub id: u16,
    pub power: f64,
}

pub async fn power(
    State(state): State<AppState>,
    Json(req): Json<PowerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.pcs.get(req.id).ok_or(EmsError::NotFound(req.id))?;
    service.set_active_power(req.power).await?;
    Ok(StatusCode::OK)
}

pub async fn reactive_power(
    State(state): State<AppState>,
    Json(req): Json<PowerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.pcs.get(req.id).ok_or(EmsError::NotFound(req.id))?;
    service.set_reactive_power(req.power).await?;
    Ok(StatusCode::OK)
}
