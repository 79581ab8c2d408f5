use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter: control and FCR-N decisions at info, HTTP access noise
/// at warn. Device poll cycles log at debug and stay out of production
/// logs unless RUST_LOG pulls them in.
const DEFAULT_FILTER: &str = "info,tower_http=warn,bess_ems::modbus=info";

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Resolves on SIGINT or SIGTERM. Station controllers deploy on Linux
/// under systemd, which stops units with SIGTERM; SIGINT covers a console
/// operator. The caller tears the subsystems down through
/// `AppState::shutdown` once this returns.
pub async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "shutdown signal received, stopping EMS");
}
