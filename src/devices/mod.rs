pub mod bms;
pub mod manager;
pub mod pcs;
pub mod plc;
pub mod windfarm;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::modbus::client::DeviceClient;

/// Reconnect policy shared by every device service: disconnect explicitly,
/// then wait `delay` and retry `connect` until it succeeds or the service
/// is cancelled. Backoff is constant. Returns false when cancelled.
pub(crate) async fn reconnect(
    client: &DeviceClient,
    delay: Duration,
    cancel: &CancellationToken,
) -> bool {
    client.disconnect().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        match client.connect().await {
            Ok(()) => {
                info!("device reconnected");
                return true;
            }
            Err(e) => debug!(error = %e, "reconnect attempt failed"),
        }
    }
}

/// Heartbeat task: a wrapping u16 counter written to `register` every
/// `interval`. Skipped while disconnected; write failures are logged and
/// left to the poll loop's reconnect handling.
pub(crate) async fn run_heartbeat(
    client: Arc<DeviceClient>,
    register: u16,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut counter: u16 = 0;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !client.is_connected() {
            continue;
        }
        counter = counter.wrapping_add(1);
        if let Err(e) = client.write_single(register, counter).await {
            warn!(error = %e, "heartbeat write failed");
        }
    }
}

/// Sleep until the next wall-clock boundary of `interval`, so persistence
/// snapshots across services line up on the same instants.
pub(crate) async fn sleep_until_boundary(interval: Duration) {
    let interval_ms = interval.as_millis().max(1) as i64;
    let since_epoch_ms = Utc::now().timestamp_millis();
    let next = (since_epoch_ms / interval_ms + 1) * interval_ms;
    let wait_ms = (next - since_epoch_ms).max(1) as u64;
    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
}

/// Per-service update channel: capacity 1, drop-on-full, so a slow
/// consumer never blocks the poll loop and never sees a backlog.
pub struct UpdateSignal {
    tx: mpsc::Sender<()>,
    rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl UpdateSignal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    /// Hand the receiving end to the single consumer (the control driver).
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.rx.lock().take()
    }
}

impl Default for UpdateSignal {
    fn default() -> Self {
        Self::new()
    }
}
