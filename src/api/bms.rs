//! Battery unit endpoints.

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
    let service = state.bms.get(id).ok_or(EmsError::NotFound(id))?;
    Ok(Json(service.telemetry().await))
}

pub async fn get_racks(
    State(state): State<AppState>,
    Path(id): Path<u16>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.bms.get(id).ok_or(EmsError::NotFound(id))?;
    Ok(Json(service.racks().await))
}

pub async fn get_rack(
    State(state): State<AppState>,
    Path((id, n)): Path<(u16, u16)>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.bms.get(id).ok_or(EmsError::NotFound(id))?;
    let rack = service.rack(n).await.ok_or(EmsError::NotFound(n))?;
    Ok(Json(rack))
}

pub async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<u16>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.bms.get(id).ok_or(EmsError::NotFound(id))?;
    Ok(Json(service.command_state().await))
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub id: u16,
}

pub async fn reset(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.bms.get(req.id).ok_or(EmsError::NotFound(req.id))?;
    service.reset().await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreakerAction {
    Open,
    Close,
}

#[derive(Debug, Deserialize)]
pub struct BreakerRequest {
    pub id: u16,
    pub action: BreakerAction,
}

pub async fn breaker(
    State(state): State<AppState>,
    Json(req): Json<BreakerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.bms.get(req.id).ok_or(EmsError::NotFound(req.id))?;
    let close = matches!(req.action, BreakerAction::Close);
    service.set_breaker(close).await?;
    Ok(StatusCode::OK)
}
