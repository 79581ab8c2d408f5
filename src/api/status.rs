use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::control::{ActivePowerControl, Mode};
use crate::fcrn::FcrnStatus;
use crate::state::{AppState, HealthReport};

#[derive(Debug, Serialize)]
pub struct UnitStatus {
    pub id: u16,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub mode: Mode,
    pub active_power_control: ActivePowerControl,
    pub health: HealthReport,
    pub bms: Vec<UnitStatus>,
    pub pcs: Vec<UnitStatus>,
    pub windfarm: Vec<UnitStatus>,
    pub fcrn: FcrnStatus,
}

pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let bms = state
        .bms
        .all()
        .iter()
        .map(|s| UnitStatus {
            id: s.id(),
            connected: s.is_connected(),
        })
        .collect();
    let pcs = state
        .pcs
        .all()
        .iter()
        .map(|s| UnitStatus {
            id: s.id(),
            connected: s.is_connected(),
        })
        .collect();
    let windfarm = state
        .windfarm
        .all()
        .iter()
        .map(|s| UnitStatus {
            id: s.id(),
            connected: s.is_connected(),
        })
        .collect();

    let body = SystemStatus {
        mode: state.control.mode(),
        active_power_control: state.control.active_power_control(),
        health: state.health(),
        bms,
        pcs,
        windfarm,
        fcrn: state.fcrn.status(),
    };
    (StatusCode::OK, Json(body))
}
