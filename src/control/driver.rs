//! Control loop driver: runs `execute_control` on every battery telemetry
//! update and at least every fallback tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ControlLogic;

/// Wait until any update channel signals. Closed channels are pruned so a
/// stopped service cannot spin the loop.
async fn wait_any(rxs: &mut Vec<mpsc::Receiver<()>>) {
    loop {
        if rxs.is_empty() {
            std::future::pending::<()>().await;
        }
        let (result, index, _) =
            futures::future::select_all(rxs.iter_mut().map(|rx| Box::pin(rx.recv()))).await;
        match result {
            Some(()) => return,
            None => {
                rxs.remove(index);
            }
        }
    }
}

/// Spawn the driver task. `update_rxs` are the per-battery update channels;
/// `tick` is the fallback period (100 ms by default), so control runs at
/// least that often and within bounded latency of any update.
pub fn spawn_control_driver(
    logic: Arc<ControlLogic>,
    mut update_rxs: Vec<mpsc::Receiver<()>>,
    tick: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = wait_any(&mut update_rxs) => {}
            }
            logic.execute_control().await;
        }
        info!("control driver stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::control::logic::tests::FakePlant;
    use crate::devices::bms::BatteryStatus;

    #[tokio::test]
    async fn update_signal_triggers_control_within_bounded_latency() {
        let plant = FakePlant::new();
        plant.set_battery(1, 50.0, BatteryStatus::Fault);
        plant.set_battery(2, 50.0, BatteryStatus::Idle);
        plant.set_command(1, 250.0);

        let logic = Arc::new(ControlLogic::new(
            Arc::clone(&plant) as _,
            ControlConfig::default(),
        ));
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        // Slow fallback so the test exercises the update path.
        let handle = spawn_control_driver(
            Arc::clone(&logic),
            vec![rx],
            Duration::from_secs(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.try_send(());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*plant.issued_active.lock(), vec![(1, 0.0)]);
        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn fallback_tick_runs_without_updates() {
        let plant = FakePlant::new();
        plant.set_battery(1, 50.0, BatteryStatus::Fault);
        plant.set_command(1, 250.0);

        let logic = Arc::new(ControlLogic::new(
            Arc::clone(&plant) as _,
            ControlConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_control_driver(
            Arc::clone(&logic),
            Vec::new(),
            Duration::from_millis(20),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!plant.issued_active.lock().is_empty());
        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn closed_update_channels_fall_back_to_ticker() {
        let plant = FakePlant::new();
        plant.set_battery(1, 50.0, BatteryStatus::Fault);
        plant.set_command(1, 250.0);

        let logic = Arc::new(ControlLogic::new(
            Arc::clone(&plant) as _,
            ControlConfig::default(),
        ));
        let (tx, rx) = mpsc::channel::<()>(1);
        drop(tx); // channel closed immediately
        let cancel = CancellationToken::new();
        let handle = spawn_control_driver(
            Arc::clone(&logic),
            vec![rx],
            Duration::from_millis(20),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!plant.issued_active.lock().is_empty());
        cancel.cancel();
        let _ = handle.await;
    }
}
