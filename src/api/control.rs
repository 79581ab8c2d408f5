//! Control mode and manual command endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::control::Mode;
use crate::state::AppState;

use super::error::ApiError;

#[derive(Debug, Serialize)]
pub struct ModeResponse {
    pub mode: Mode,
}

pub async fn get_mode(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModeResponse {
        mode: state.control.mode(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub mode: Mode,
}

pub async fn set_mode(
    State(state): State<AppState>,
    Json(req): Json<SetModeRequest>,
) -> impl IntoResponse {
    state.control.set_mode(req.mode);
    (
        StatusCode::OK,
        Json(ModeResponse {
            mode: state.control.mode(),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct ManualPowerRequest {
    pub power: f64,
}

#[derive(Debug, Serialize)]
pub struct ManualPowerResponse {
    pub commanded_kw: f64,
}

pub async fn manual_power(
    State(state): State<AppState>,
    Json(req): Json<ManualPowerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let commanded_kw = state.control.manual_power_command(req.power).await?;
    Ok(Json(ManualPowerResponse { commanded_kw }))
}

pub async fn manual_reactive_power(
    State(state): State<AppState>,
    Json(req): Json<ManualPowerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .control
        .manual_reactive_power_command(req.power)
        .await?;
    Ok(StatusCode::OK)
}
