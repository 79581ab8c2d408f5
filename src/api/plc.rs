//! Protection equipment endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;

use crate::devices::plc::BreakerKind;
use crate::error::EmsError;
use crate::state::AppState;

use super::error::ApiError;

pub async fn get_state(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let plc = state.plc.as_ref().ok_or(EmsError::NotFound(0))?;
    Ok(Json(plc.telemetry().await))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerTarget {
    Auxiliary,
    MediumVoltage,
    Pcs,
    Battery,
}

#[derive(Debug, Deserialize)]
pub struct BreakerRequest {
    pub target: BreakerTarget,
    /// Unit number for per-unit breakers; ignored for station breakers.
    #[serde(default)]
    pub id: u16,
    pub close: bool,
}

pub async fn set_breaker(
    State(state): State<AppState>,
    Json(req): Json<BreakerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let plc = state.plc.as_ref().ok_or(EmsError::NotFound(0))?;
    let kind = match req.target {
        BreakerTarget::Auxiliary => BreakerKind::Auxiliary,
        BreakerTarget::MediumVoltage => BreakerKind::MediumVoltage,
        BreakerTarget::Pcs => {
            if req.id == 0 {
                return Err(EmsError::NotFound(0).into());
            }
            BreakerKind::Pcs(req.id)
        }
        BreakerTarget::Battery => {
            if req.id == 0 {
                return Err(EmsError::NotFound(0).into());
            }
            BreakerKind::Battery(req.id)
        }
    };
    plc.set_breaker(kind, req.close).await?;
    Ok(StatusCode::OK)
}
