//! Keyed device managers. One manager per device class; each fans commands
//! out concurrently and aggregates `(failed, total, last_error)`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;

use super::bms::BmsService;
use super::pcs::PcsService;
use super::windfarm::{WindFarmService, WindFarmSummary};

/// Aggregate result of a fan-out command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanOutStatus {
    pub total: usize,
    pub failed: usize,
    pub last_error: Option<String>,
}

impl FanOutStatus {
    pub fn all_ok(&self) -> bool {
        self.failed == 0
    }
}

/// Run one task per unit, wait for all, count failures and keep the last
/// error. No global error list; the log carries the per-unit detail.
async fn fan_out<F>(ops: Vec<(u16, F)>) -> FanOutStatus
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let handles: Vec<(u16, tokio::task::JoinHandle<Result<()>>)> = ops
        .into_iter()
        .map(|(id, fut)| (id, tokio::spawn(fut)))
        .collect();

    let mut status = FanOutStatus {
        total: handles.len(),
        ..Default::default()
    };
    for (id, handle) in handles {
        let outcome = match handle.await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("unit {}: {}", id, e),
            Err(e) => format!("unit {}: task failed: {}", id, e),
        };
        warn!(unit = id, error = %outcome, "fan-out command failed");
        status.failed += 1;
        status.last_error = Some(outcome);
    }
    status
}

/// Battery unit manager.
pub struct BmsManager {
    services: BTreeMap<u16, Arc<BmsService>>,
}

impl BmsManager {
    pub fn new(services: Vec<Arc<BmsService>>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.id(), s)).collect(),
        }
    }

    pub fn get(&self, id: u16) -> Option<Arc<BmsService>> {
        self.services.get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<BmsService>> {
        self.services.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<u16> {
        self.services.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Start every service in id order; the first failure aborts and is
    /// returned.
    pub fn start_all(&self) -> Result<()> {
        for service in self.services.values() {
            service.start()?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for service in self.services.values() {
            service.stop().await;
        }
    }

    pub async fn reset_all(&self) -> FanOutStatus {
        let ops = self
            .services
            .values()
            .map(|s| {
                let s = Arc::clone(s);
                (s.id(), async move { s.reset().await })
            })
            .collect();
        fan_out(ops).await
    }

    pub fn connected_units(&self) -> usize {
        self.services.values().filter(|s| s.is_connected()).count()
    }
}

/// Power conversion unit manager.
pub struct PcsManager {
    services: BTreeMap<u16, Arc<PcsService>>,
}

impl PcsManager {
    pub fn new(services: Vec<Arc<PcsService>>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.id(), s)).collect(),
        }
    }

    pub fn get(&self, id: u16) -> Option<Arc<PcsService>> {
        self.services.get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<PcsService>> {
        self.services.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<u16> {
        self.services.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn start_all(&self) -> Result<()> {
        for service in self.services.values() {
            service.start()?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for service in self.services.values() {
            service.stop().await;
        }
    }

    pub async fn start_stop_all(&self, start: bool) -> FanOutStatus {
        let ops = self
            .services
            .values()
            .map(|s| {
                let s = Arc::clone(s);
                (s.id(), async move { s.start_stop(start).await })
            })
            .collect();
        fan_out(ops).await
    }

    pub async fn set_active_power_all(&self, kw: f64) -> FanOutStatus {
        let ops = self
            .services
            .values()
            .map(|s| {
                let s = Arc::clone(s);
                (s.id(), async move { s.set_active_power(kw).await })
            })
            .collect();
        fan_out(ops).await
    }

    pub async fn set_reactive_power_all(&self, kvar: f64) -> FanOutStatus {
        let ops = self
            .services
            .values()
            .map(|s| {
                let s = Arc::clone(s);
                (s.id(), async move { s.set_reactive_power(kvar).await })
            })
            .collect();
        fan_out(ops).await
    }

    pub async fn reset_all(&self) -> FanOutStatus {
        let ops = self
            .services
            .values()
            .map(|s| {
                let s = Arc::clone(s);
                (s.id(), async move { s.reset().await })
            })
            .collect();
        fan_out(ops).await
    }

    pub fn connected_units(&self) -> usize {
        self.services.values().filter(|s| s.is_connected()).count()
    }
}

/// Wind farm unit manager with cross-unit aggregates.
pub struct WindFarmManager {
    services: BTreeMap<u16, Arc<WindFarmService>>,
}

impl WindFarmManager {
    pub fn new(services: Vec<Arc<WindFarmService>>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.id(), s)).collect(),
        }
    }

    pub fn get(&self, id: u16) -> Option<Arc<WindFarmService>> {
        self.services.get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<WindFarmService>> {
        self.services.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn start_all(&self) -> Result<()> {
        for service in self.services.values() {
            service.start()?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for service in self.services.values() {
            service.stop().await;
        }
    }

    pub async fn set_power_limit_all(&self, kw: f64) -> FanOutStatus {
        let ops = self
            .services
            .values()
            .map(|s| {
                let s = Arc::clone(s);
                (s.id(), async move { s.set_power_limit(kw).await })
            })
            .collect();
        fan_out(ops).await
    }

    /// Totals across units: powers sum, wind speed averages, and the
    /// online flag holds only when every FCU reports online.
    pub async fn summary(&self) -> WindFarmSummary {
        let mut summary = WindFarmSummary {
            all_fcu_online: !self.services.is_empty(),
            ..Default::default()
        };
        let mut wind_sum = 0.0;
        for service in self.services.values() {
            let t = service.telemetry().await;
            summary.total_active_power_kw += t.active_power_kw;
            summary.total_reactive_power_kvar += t.reactive_power_kvar;
            summary.total_possible_power_kw += t.possible_power_kw;
            wind_sum += t.wind_speed_ms;
            summary.all_fcu_online &= t.fcu_online;
            summary.unit_count += 1;
        }
        if summary.unit_count > 0 {
            summary.average_wind_speed_ms = wind_sum / summary.unit_count as f64;
        }
        summary
    }

    pub fn connected_units(&self) -> usize {
        self.services.values().filter(|s| s.is_connected()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::AlarmManager;
    use crate::config::DeviceEndpoint;
    use crate::devices::windfarm::WindFarmTelemetry;
    use crate::persistence::{spawn_persistence_worker, LoggingSink};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn endpoint(id: u16) -> DeviceEndpoint {
        DeviceEndpoint {
            id,
            host: "127.0.0.1".to_string(),
            port: 1502,
            unit_id: id as u8,
            poll_interval_ms: 200,
            heartbeat_interval_ms: 1000,
            persist_interval_s: 60,
            reconnect_delay_ms: 500,
            request_timeout_ms: 500,
            rack_count: 1,
        }
    }

    fn persistence() -> crate::persistence::PersistenceHandle {
        spawn_persistence_worker(Arc::new(LoggingSink), 16, CancellationToken::new())
    }

    fn pcs_manager(n: u16) -> PcsManager {
        let alarms = Arc::new(AlarmManager::new());
        let services = (1..=n)
            .map(|id| {
                crate::devices::pcs::PcsService::new(
                    endpoint(id),
                    Arc::clone(&alarms),
                    persistence(),
                )
                .unwrap()
            })
            .collect();
        PcsManager::new(services)
    }

    #[tokio::test]
    async fn fan_out_counts_failures_and_keeps_last_error() {
        // All units are disconnected, so every command fails.
        let manager = pcs_manager(3);
        let status = manager.set_active_power_all(100.0).await;
        assert_eq!(status.total, 3);
        assert_eq!(status.failed, 3);
        assert!(!status.all_ok());
        assert!(status.last_error.as_deref().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn managers_resolve_units_by_id() {
        let manager = pcs_manager(2);
        assert!(manager.get(1).is_some());
        assert!(manager.get(2).is_some());
        assert!(manager.get(3).is_none());
        assert_eq!(manager.ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn windfarm_summary_aggregates_units() {
        let services: Vec<_> = (1..=2)
            .map(|id| {
                crate::devices::windfarm::WindFarmService::new(endpoint(id), persistence())
                    .unwrap()
            })
            .collect();

        services[0]
            .publish_for_tests(WindFarmTelemetry {
                timestamp: Utc::now(),
                active_power_kw: 500.0,
                reactive_power_kvar: 20.0,
                possible_power_kw: 800.0,
                wind_speed_ms: 10.0,
                fcu_online: true,
                turbine_count: 6,
            })
            .await;
        services[1]
            .publish_for_tests(WindFarmTelemetry {
                timestamp: Utc::now(),
                active_power_kw: 300.0,
                reactive_power_kvar: -5.0,
                possible_power_kw: 700.0,
                wind_speed_ms: 8.0,
                fcu_online: false,
                turbine_count: 6,
            })
            .await;

        let manager = WindFarmManager::new(services);
        let summary = manager.summary().await;
        assert_eq!(summary.total_active_power_kw, 800.0);
        assert_eq!(summary.total_possible_power_kw, 1500.0);
        assert_eq!(summary.average_wind_speed_ms, 9.0);
        assert_eq!(summary.unit_count, 2);
        assert!(!summary.all_fcu_online);
    }

    #[tokio::test]
    async fn empty_windfarm_summary_is_not_online() {
        let manager = WindFarmManager::new(Vec::new());
        let summary = manager.summary().await;
        assert_eq!(summary.unit_count, 0);
        assert!(!summary.all_fcu_online);
    }

    #[tokio::test]
    async fn double_start_propagates_first_error() {
        let manager = pcs_manager(2);
        assert!(manager.start_all().is_ok());
        assert!(manager.start_all().is_err());
        manager.stop_all().await;
    }
}
