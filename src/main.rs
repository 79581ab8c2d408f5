use anyhow::Result;
use axum::Router;
use bess_ems::config::AppConfig;
use bess_ems::state::AppState;
use bess_ems::telemetry::{init_tracing, shutdown_signal};
use bess_ems::{api, modbus};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = AppConfig::load()?;
    let state = AppState::new(cfg.clone()).await?;

    state.start().await?;

    let register_server = modbus::server::RegisterServer::new(
        cfg.register_server.socket_addr()?,
        state.bms.clone(),
        state.pcs.clone(),
    );
    register_server.spawn(state.cancel.child_token());

    let app: Router = api::router(state.clone());
    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting BESS EMS");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    warn!("shutdown complete");
    Ok(())
}
