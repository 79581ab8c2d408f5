pub mod alarms;
pub mod bms;
pub mod control;
pub mod error;
pub mod fcrn;
pub mod health;
pub mod pcs;
pub mod plc;
pub mod status;
pub mod windfarm;

use axum::routing::{get, post};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status::get_status))
        .route("/healthz", get(health::healthz))
        // Battery units
        .route("/bms/:id", get(bms::get_unit))
        .route("/bms/:id/racks", get(bms::get_racks))
        .route("/bms/:id/racks/:n", get(bms::get_rack))
        .route("/bms/:id/command", get(bms::get_command))
        .route("/bms/reset", post(bms::reset))
        .route("/bms/breaker", post(bms::breaker))
        // Power conversion units
        .route("/pcs/:id", get(pcs::get_unit))
        .route("/pcs/:id/command", get(pcs::get_command))
        .route("/pcs/start-stop", post(pcs::start_stop))
        .route("/pcs/power", post(pcs::power))
        .route("/pcs/reactive-power", post(pcs::reactive_power))
        // Control
        .route("/control/mode", get(control::get_mode).post(control::set_mode))
        .route("/control/power", post(control::manual_power))
        .route("/control/reactive-power", post(control::manual_reactive_power))
        // Alarms
        .route("/alarms", get(alarms::list))
        // Protection equipment
        .route("/plc", get(plc::get_state))
        .route("/plc/circuit-breaker", post(plc::set_breaker))
        // Wind farm
        .route("/windfarm/summary", get(windfarm::summary))
        .route("/windfarm/:id", get(windfarm::get_unit))
        .route("/windfarm/power-limit", post(windfarm::set_power_limit))
        // FCR-N
        .route("/fcrn", get(fcrn::get_status))
        .route("/fcrn/activate", post(fcrn::activate))
        .route("/fcrn/deactivate", post(fcrn::deactivate))
        .route("/fcrn/capacity", post(fcrn::set_capacity))
        .route("/fcrn/droop", post(fcrn::set_droop))
        .route("/fcrn/baseline", post(fcrn::set_baseline))
        .route("/fcrn/test/frequency", post(fcrn::test_frequency))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
