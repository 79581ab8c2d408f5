//! FCR-N endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::error::EmsError;
use crate::state::AppState;

use super::error::ApiError;

#[derive(Debug, Serialize)]
pub struct FcrnOverview {
    #[serde(flatten)]
    pub status: crate::fcrn::FcrnStatus,
    pub maintained_capacity_kw: f64,
}

pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(FcrnOverview {
        status: state.fcrn.status(),
        maintained_capacity_kw: state.fcrn.maintained_capacity(),
    })
}

pub async fn activate(State(state): State<AppState>) -> impl IntoResponse {
    state.fcrn.activate();
    StatusCode::OK
}

pub async fn deactivate(State(state): State<AppState>) -> impl IntoResponse {
    state.fcrn.deactivate().await;
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct CapacityRequest {
    pub capacity: f64,
}

pub async fn set_capacity(
    State(state): State<AppState>,
    Json(req): Json<CapacityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !(req.capacity > 0.0) {
        return Err(EmsError::out_of_range("capacity", req.capacity, 0.0, f64::INFINITY).into());
    }
    state.fcrn.set_capacity(req.capacity)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct DroopRequest {
    pub droop: f64,
}

pub async fn set_droop(
    State(state): State<AppState>,
    Json(req): Json<DroopRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.fcrn.set_droop(req.droop)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct BaselineRequest {
    pub baseline: f64,
}

pub async fn set_baseline(
    State(state): State<AppState>,
    Json(req): Json<BaselineRequest>,
) -> impl IntoResponse {
    state.fcrn.update_baseline(req.baseline);
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct TestFrequencyRequest {
    pub frequency: f64,
}

pub async fn test_frequency(
    State(state): State<AppState>,
    Json(req): Json<TestFrequencyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.fcrn.inject_test_frequency(req.frequency)?;
    Ok(StatusCode::OK)
}
