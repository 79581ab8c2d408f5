//! FCR-N service: wires the controller to a frequency source, the battery
//! manager (SOC) and the power-conversion manager (dispatch).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FcrnConfig;
use crate::devices::manager::{BmsManager, PcsManager};
use crate::error::{EmsError, Result};

use super::controller::{FcrnController, FcrnStatus, PowerSink};

/// Grid frequency capability. Pull-type sources do their fetch in
/// `refresh`; push-type sources ignore it and serve the cached value.
#[async_trait]
pub trait FrequencySource: Send + Sync {
    async fn refresh(&self) {}
    /// Current frequency, or `StaleFrequency` when the reading is older
    /// than the staleness bound.
    async fn get_frequency(&self) -> Result<f64>;
}

const FREQUENCY_STALE_AFTER_S: i64 = 5;

/// Frequency taken from a PCS unit's grid measurement.
pub struct PcsFrequencySource {
    pcs: Arc<PcsManager>,
    unit: u16,
}

impl PcsFrequencySource {
    pub fn new(pcs: Arc<PcsManager>, unit: u16) -> Self {
        Self { pcs, unit }
    }
}

#[async_trait]
impl FrequencySource for PcsFrequencySource {
    async fn get_frequency(&self) -> Result<f64> {
        let service = self.pcs.get(self.unit).ok_or(EmsError::NotFound(self.unit))?;
        let telemetry = service.telemetry().await;
        if telemetry.timestamp == DateTime::UNIX_EPOCH
            || (Utc::now() - telemetry.timestamp).num_seconds() > FREQUENCY_STALE_AFTER_S
        {
            return Err(EmsError::StaleFrequency);
        }
        Ok(telemetry.grid_frequency_hz)
    }
}

/// Power sink fanning the controller output to every PCS unit as equal
/// shares; the percent-of-capacity figure goes to the log.
pub struct PcsPowerSink {
    pcs: Arc<PcsManager>,
    capacity_kw: f64,
}

impl PcsPowerSink {
    pub fn new(pcs: Arc<PcsManager>, capacity_kw: f64) -> Self {
        Self { pcs, capacity_kw }
    }
}

#[async_trait]
impl PowerSink for PcsPowerSink {
    async fn send_power(&self, kw: f64) {
        let units = self.pcs.len();
        if units == 0 {
            return;
        }
        let percent = if self.capacity_kw > 0.0 {
            kw / self.capacity_kw * 100.0
        } else {
            0.0
        };
        let per_unit_kw = kw / units as f64;
        debug!(total_kw = kw, percent, per_unit_kw, "FCR-N power dispatch");
        let status = self.pcs.set_active_power_all(per_unit_kw).await;
        if !status.all_ok() {
            warn!(
                failed = status.failed,
                total = status.total,
                last_error = ?status.last_error,
                "FCR-N power dispatch partially failed"
            );
        }
    }
}

pub struct FcrnService {
    cfg: FcrnConfig,
    controller: Arc<FcrnController>,
    source: Arc<dyn FrequencySource>,
    sink: Arc<dyn PowerSink>,
    bms: Arc<BmsManager>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl FcrnService {
    pub fn new(
        cfg: FcrnConfig,
        source: Arc<dyn FrequencySource>,
        sink: Arc<dyn PowerSink>,
        bms: Arc<BmsManager>,
    ) -> Result<Arc<Self>> {
        let controller = FcrnController::new(cfg.clone(), Arc::clone(&sink))?;
        Ok(Arc::new(Self {
            cfg,
            controller,
            source,
            sink,
            bms,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }))
    }

    /// Start the controller task plus the frequency, SOC and telemetry
    /// monitor loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EmsError::ConfigInvalid(
                "FCR-N service already started".to_string(),
            ));
        }
        self.controller.start()?;

        let service = Arc::clone(self);
        let rate = Duration::from_millis(self.cfg.frequency_update_rate_ms);
        tokio::spawn(async move { service.run_frequency_monitor(rate).await });

        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_soc_monitor().await });

        if let Some(secs) = self.cfg.telemetry_interval_s {
            let service = Arc::clone(self);
            tokio::spawn(async move {
                service.run_telemetry(Duration::from_secs(secs.max(1))).await
            });
        }
        info!("FCR-N service started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.controller.stop().await;
        info!("FCR-N service stopped");
    }

    async fn run_frequency_monitor(self: Arc<Self>, rate: Duration) {
        let mut ticker = tokio::time::interval(rate);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.source.refresh().await;
            match self.source.get_frequency().await {
                Ok(hz) => self.controller.update_frequency(hz),
                Err(e) => debug!(error = %e, "frequency source unavailable"),
            }
        }
    }

    async fn run_soc_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(service) = self.bms.get(self.cfg.pcs_number) else {
                continue;
            };
            let telemetry = service.telemetry().await;
            if telemetry.timestamp == DateTime::UNIX_EPOCH {
                continue;
            }
            self.controller
                .update_soc(self.apply_soc_clamp(telemetry.soc_percent));
        }
    }

    /// Commissioning-rig clamp: readings outside [40, 60] become 50.
    /// Off by default; see `fcrn.soc_debug_clamp`.
    fn apply_soc_clamp(&self, soc: f64) -> f64 {
        if self.cfg.soc_debug_clamp && !(40.0..=60.0).contains(&soc) {
            50.0
        } else {
            soc
        }
    }

    async fn run_telemetry(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let s = self.controller.status();
            info!(
                active = s.active,
                f_measured_hz = s.f_measured_hz,
                f_reference_hz = s.f_reference_hz,
                activated_power_kw = s.activated_power_kw,
                nem_power_kw = s.nem_power_kw,
                total_power_kw = s.total_power_kw,
                soc_percent = s.soc_percent,
                nem_current = s.nem_current,
                endurance_up_min = s.endurance_up_min,
                endurance_down_min = s.endurance_down_min,
                "FCR-N state"
            );
        }
    }

    pub fn activate(&self) {
        self.controller.activate();
    }

    pub async fn deactivate(&self) {
        self.controller.deactivate().await;
    }

    pub fn status(&self) -> FcrnStatus {
        self.controller.status()
    }

    pub fn set_capacity(&self, kw: f64) -> Result<()> {
        self.controller.set_capacity(kw)
    }

    pub fn set_droop(&self, percent: f64) -> Result<()> {
        self.controller.set_droop(percent)
    }

    pub fn update_baseline(&self, kw: f64) {
        self.controller.update_baseline(kw)
    }

    pub fn maintained_capacity(&self) -> f64 {
        self.controller.maintained_capacity()
    }

    /// Inject a frequency for commissioning tests, bypassing the source.
    pub fn inject_test_frequency(&self, hz: f64) -> Result<()> {
        if !(49.0..=51.0).contains(&hz) {
            return Err(EmsError::out_of_range("test frequency", hz, 49.0, 51.0));
        }
        warn!(hz, "test frequency injected");
        self.controller.update_frequency(hz);
        Ok(())
    }

    /// Fan a power command out to every PCS unit.
    pub async fn send_power_command(&self, kw: f64) {
        self.sink.send_power(kw).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FixedSource {
        hz: Mutex<Result<f64>>,
    }

    #[async_trait]
    impl FrequencySource for FixedSource {
        async fn get_frequency(&self) -> Result<f64> {
            match &*self.hz.lock() {
                Ok(v) => Ok(*v),
                Err(_) => Err(EmsError::StaleFrequency),
            }
        }
    }

    struct NullSink;

    #[async_trait]
    impl PowerSink for NullSink {
        async fn send_power(&self, _kw: f64) {}
    }

    fn service(cfg: FcrnConfig) -> Arc<FcrnService> {
        let source = Arc::new(FixedSource {
            hz: Mutex::new(Ok(50.0)),
        });
        let bms = Arc::new(BmsManager::new(Vec::new()));
        FcrnService::new(cfg, source, Arc::new(NullSink), bms).unwrap()
    }

    #[tokio::test]
    async fn soc_clamp_is_disabled_by_default() {
        let svc = service(FcrnConfig::default());
        assert_eq!(svc.apply_soc_clamp(12.0), 12.0);
        assert_eq!(svc.apply_soc_clamp(97.0), 97.0);
    }

    #[tokio::test]
    async fn soc_clamp_pins_out_of_band_readings_when_enabled() {
        let cfg = FcrnConfig {
            soc_debug_clamp: true,
            ..FcrnConfig::default()
        };
        let svc = service(cfg);
        assert_eq!(svc.apply_soc_clamp(12.0), 50.0);
        assert_eq!(svc.apply_soc_clamp(97.0), 50.0);
        assert_eq!(svc.apply_soc_clamp(45.0), 45.0);
    }

    #[tokio::test]
    async fn test_frequency_injection_validates_range() {
        let svc = service(FcrnConfig::default());
        assert!(svc.inject_test_frequency(48.5).is_err());
        assert!(svc.inject_test_frequency(51.5).is_err());
        assert!(svc.inject_test_frequency(49.95).is_ok());
        assert_eq!(svc.status().f_measured_hz, 49.95);
    }

    #[tokio::test]
    async fn capacity_and_droop_pass_through_to_controller() {
        let svc = service(FcrnConfig::default());
        svc.set_capacity(750.0).unwrap();
        assert_eq!(svc.status().capacity_kw, 750.0);
        assert!(svc.set_droop(150.0).is_err());
    }

    #[tokio::test]
    async fn empty_pcs_manager_sink_is_a_no_op() {
        let pcs = Arc::new(PcsManager::new(Vec::new()));
        let sink = PcsPowerSink::new(pcs, 1000.0);
        sink.send_power(500.0).await; // must not panic
    }
}
