//! FCR-N controller: linear frequency droop response inside the standard
//! band, with the NEM and AEM energy-management overlays and endurance
//! accounting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::FcrnConfig;
use crate::error::{EmsError, Result};

pub const F_NOMINAL: f64 = 50.0;
pub const F_MIN: f64 = 49.9;
pub const F_MAX: f64 = 50.1;
pub const DEADBAND_HZ: f64 = 0.1;
pub const NEM_FACTOR: f64 = 0.10;
/// Rolling-average window in samples; also the constant divisor that
/// defines the 300 s activation ramp.
pub const WINDOW: usize = 300;

const ENDURANCE_SENTINEL_MIN: f64 = 9999.0;
const FREQUENCY_STALE_AFTER: Duration = Duration::from_secs(5);
const SAMPLE_SPACING: Duration = Duration::from_secs(1);

/// Where computed total power goes each tick.
#[async_trait]
pub trait PowerSink: Send + Sync {
    async fn send_power(&self, kw: f64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NemDirection {
    Idle,
    Charging,
    Discharging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AemSide {
    None,
    Low,
    High,
}

/// SOC-fraction thresholds derived from capacity and reservoir size. The
/// NEM pair corresponds to 30 / 57.5 minutes of full activation, the AEM
/// pair to 5 / 10 minutes.
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    enable_nem_low: f64,
    disable_nem_low: f64,
    enable_nem_high: f64,
    disable_nem_high: f64,
    enable_aem_low: f64,
    disable_aem_low: f64,
    enable_aem_high: f64,
    disable_aem_high: f64,
}

impl Thresholds {
    fn compute(capacity_kw: f64, reservoir_kwh: f64) -> Self {
        let minutes = |m: f64| capacity_kw * m / 60.0 / reservoir_kwh;
        Self {
            enable_nem_low: minutes(30.0),
            disable_nem_low: minutes(57.5),
            enable_nem_high: 1.0 - minutes(30.0),
            disable_nem_high: 1.0 - minutes(57.5),
            enable_aem_low: minutes(5.0),
            disable_aem_low: minutes(10.0),
            enable_aem_high: 1.0 - minutes(5.0),
            disable_aem_high: 1.0 - minutes(10.0),
        }
    }
}

struct FcrnState {
    active: bool,
    capacity_kw: f64,
    droop_percent: f64,
    thresholds: Thresholds,
    f_measured: f64,
    last_frequency_update: Option<Instant>,
    f_reference: f64,
    soc_percent: f64,
    baseline_kw: f64,
    nem_direction: NemDirection,
    nem_history: VecDeque<f64>,
    last_nem_sample: Option<Instant>,
    nem_current: f64,
    nem_active: bool,
    aem_side: AemSide,
    aem_history: VecDeque<f64>,
    last_aem_sample: Option<Instant>,
    activated_power_kw: f64,
    nem_power_kw: f64,
    total_power_kw: f64,
    endurance_up_min: f64,
    endurance_down_min: f64,
    last_update: Option<DateTime<Utc>>,
}

impl FcrnState {
    fn new(capacity_kw: f64, droop_percent: f64, reservoir_kwh: f64) -> Self {
        Self {
            active: false,
            capacity_kw,
            droop_percent,
            thresholds: Thresholds::compute(capacity_kw, reservoir_kwh),
            f_measured: F_NOMINAL,
            last_frequency_update: None,
            f_reference: F_NOMINAL,
            soc_percent: 50.0,
            baseline_kw: 0.0,
            nem_direction: NemDirection::Idle,
            nem_history: VecDeque::with_capacity(WINDOW),
            last_nem_sample: None,
            nem_current: 0.0,
            nem_active: false,
            aem_side: AemSide::None,
            aem_history: VecDeque::with_capacity(WINDOW),
            last_aem_sample: None,
            activated_power_kw: 0.0,
            nem_power_kw: 0.0,
            total_power_kw: 0.0,
            endurance_up_min: ENDURANCE_SENTINEL_MIN,
            endurance_down_min: ENDURANCE_SENTINEL_MIN,
            last_update: None,
        }
    }

    fn reset_energy_management(&mut self) {
        self.nem_direction = NemDirection::Idle;
        self.nem_history.clear();
        self.last_nem_sample = None;
        self.nem_current = 0.0;
        self.nem_active = false;
        self.aem_side = AemSide::None;
        self.aem_history.clear();
        self.last_aem_sample = None;
        self.f_reference = F_NOMINAL;
    }
}

#[derive(Debug, PartialEq)]
enum StepOutcome {
    Inactive,
    StaleFrequency,
    Output(f64),
}

/// NEM_Allowed state machine. Outside the standard frequency band the
/// direction clears and the output is 0.
fn nem_allowed(state: &mut FcrnState, soc_fraction: f64) -> f64 {
    if !(F_MIN..=F_MAX).contains(&state.f_measured) {
        state.nem_direction = NemDirection::Idle;
        return 0.0;
    }
    let t = state.thresholds;
    state.nem_direction = match state.nem_direction {
        NemDirection::Idle if soc_fraction < t.enable_nem_low => NemDirection::Charging,
        NemDirection::Idle if soc_fraction > t.enable_nem_high => NemDirection::Discharging,
        NemDirection::Charging if soc_fraction >= t.disable_nem_low => NemDirection::Idle,
        NemDirection::Discharging if soc_fraction <= t.disable_nem_high => NemDirection::Idle,
        direction => direction,
    };
    match state.nem_direction {
        NemDirection::Charging => -1.0,
        NemDirection::Idle => 0.0,
        NemDirection::Discharging => 1.0,
    }
}

/// One controller tick. Pure over `(state, now)` so tests drive it with
/// synthetic clocks.
fn step(
    state: &mut FcrnState,
    now: Instant,
    enable_energy_management: bool,
    reservoir_kwh: f64,
) -> StepOutcome {
    if !state.active {
        return StepOutcome::Inactive;
    }
    match state.last_frequency_update {
        Some(at) if now.duration_since(at) <= FREQUENCY_STALE_AFTER => {}
        _ => return StepOutcome::StaleFrequency,
    }

    let capacity = state.capacity_kw;
    let soc_fraction = state.soc_percent / 100.0;

    let allowed = nem_allowed(state, soc_fraction);

    // Rolling NEM average: one sample per second, divisor fixed at the
    // window size so activation ramps over WINDOW seconds.
    if state
        .last_nem_sample
        .map_or(true, |at| now.duration_since(at) >= SAMPLE_SPACING)
    {
        state.nem_history.push_back(allowed);
        while state.nem_history.len() > WINDOW {
            state.nem_history.pop_front();
        }
        state.last_nem_sample = Some(now);
    }
    state.nem_current = state.nem_history.iter().sum::<f64>() / WINDOW as f64;

    let t = state.thresholds;
    state.aem_side = match state.aem_side {
        AemSide::None if soc_fraction <= t.enable_aem_low => AemSide::Low,
        AemSide::None if soc_fraction >= t.enable_aem_high => AemSide::High,
        AemSide::Low if soc_fraction >= t.disable_aem_low => AemSide::None,
        AemSide::High if soc_fraction <= t.disable_aem_high => AemSide::None,
        side => side,
    };
    let aem_active = state.aem_side != AemSide::None;
    state.nem_active = state.nem_current != 0.0;

    // AEM frequency reference: saturated mean over the history while AEM
    // holds; plain follow-through otherwise.
    if !aem_active {
        state.f_reference = state.f_measured;
        state.aem_history.clear();
        state.last_aem_sample = None;
    } else {
        if state
            .last_aem_sample
            .map_or(true, |at| now.duration_since(at) >= SAMPLE_SPACING)
        {
            state
                .aem_history
                .push_back(state.f_measured.clamp(F_MIN, F_MAX));
            while state.aem_history.len() > WINDOW {
                state.aem_history.pop_front();
            }
            state.last_aem_sample = Some(now);
        }
        state.f_reference = if state.aem_history.is_empty() {
            state.f_measured
        } else {
            state.aem_history.iter().sum::<f64>() / state.aem_history.len() as f64
        };
    }

    state.activated_power_kw =
        (capacity * (F_NOMINAL - state.f_reference) / DEADBAND_HZ).clamp(-capacity, capacity);

    state.nem_power_kw = if state.nem_active {
        NEM_FACTOR * capacity * state.nem_current
    } else {
        0.0
    };

    let bound = capacity * (1.0 + NEM_FACTOR);
    state.total_power_kw = (state.baseline_kw + state.activated_power_kw + state.nem_power_kw)
        .clamp(-bound, bound);

    if enable_energy_management {
        let energy_now_kwh = soc_fraction * reservoir_kwh;
        state.endurance_up_min = if aem_active && soc_fraction <= t.enable_aem_low {
            0.0
        } else {
            let drain_kw = state.total_power_kw + capacity;
            if drain_kw > 0.0 {
                (energy_now_kwh / drain_kw * 60.0).max(0.0)
            } else {
                ENDURANCE_SENTINEL_MIN
            }
        };
        state.endurance_down_min = if aem_active && soc_fraction >= t.enable_aem_high {
            0.0
        } else {
            let supply_kw = capacity - state.total_power_kw;
            if supply_kw > 0.0 {
                (((reservoir_kwh - energy_now_kwh) / supply_kw) * 60.0).max(0.0)
            } else {
                ENDURANCE_SENTINEL_MIN
            }
        };
    }

    state.last_update = Some(Utc::now());
    StepOutcome::Output(state.total_power_kw)
}

/// Serialized controller state for the HTTP surface and telemetry loop.
#[derive(Debug, Clone, Serialize)]
pub struct FcrnStatus {
    pub enabled: bool,
    pub active: bool,
    pub nem_active: bool,
    pub aem_active: bool,
    pub f_measured_hz: f64,
    pub f_reference_hz: f64,
    pub activated_power_kw: f64,
    pub baseline_kw: f64,
    pub nem_power_kw: f64,
    pub total_power_kw: f64,
    pub capacity_kw: f64,
    pub droop_percent: f64,
    pub soc_percent: f64,
    pub endurance_up_min: f64,
    pub endurance_down_min: f64,
    pub nem_current: f64,
    pub last_update: Option<DateTime<Utc>>,
}

pub struct FcrnController {
    cfg: FcrnConfig,
    state: Mutex<FcrnState>,
    sink: Arc<dyn PowerSink>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl FcrnController {
    pub fn new(cfg: FcrnConfig, sink: Arc<dyn PowerSink>) -> Result<Arc<Self>> {
        if !(cfg.capacity_kw >= 0.0) {
            return Err(EmsError::ConfigInvalid(
                "FCR-N capacity must be non-negative".to_string(),
            ));
        }
        if !(cfg.droop_percent > 0.0 && cfg.droop_percent <= 100.0) {
            return Err(EmsError::ConfigInvalid(
                "FCR-N droop must be in (0, 100]".to_string(),
            ));
        }
        let state = FcrnState::new(cfg.capacity_kw, cfg.droop_percent, cfg.reservoir_capacity_kwh);
        Ok(Arc::new(Self {
            cfg,
            state: Mutex::new(state),
            sink,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }))
    }

    /// Spawn the periodic control task.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EmsError::ConfigInvalid(
                "FCR-N controller already started".to_string(),
            ));
        }
        let controller = Arc::clone(self);
        let interval = Duration::from_millis(self.cfg.update_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                controller.tick().await;
            }
            info!("FCR-N control task stopped");
        });
        info!(
            capacity_kw = self.cfg.capacity_kw,
            update_interval_ms = self.cfg.update_interval_ms,
            "FCR-N controller started"
        );
        Ok(())
    }

    /// Return to baseline and terminate the control task.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let baseline = {
            let mut state = self.state.lock();
            state.active = false;
            state.baseline_kw
        };
        self.sink.send_power(baseline).await;
        info!("FCR-N controller stopped");
    }

    pub fn activate(&self) {
        self.state.lock().active = true;
        info!("FCR-N activated");
    }

    /// Deactivate: clear histories, reset the reference to nominal and
    /// command baseline.
    pub async fn deactivate(&self) {
        let baseline = {
            let mut state = self.state.lock();
            state.active = false;
            state.reset_energy_management();
            state.baseline_kw
        };
        self.sink.send_power(baseline).await;
        info!("FCR-N deactivated, returned to baseline");
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn update_frequency(&self, hz: f64) {
        let mut state = self.state.lock();
        state.f_measured = hz;
        state.last_frequency_update = Some(Instant::now());
    }

    pub fn update_soc(&self, percent: f64) {
        self.state.lock().soc_percent = percent.clamp(0.0, 100.0);
    }

    pub fn update_baseline(&self, kw: f64) {
        self.state.lock().baseline_kw = kw;
    }

    pub fn set_capacity(&self, kw: f64) -> Result<()> {
        if !kw.is_finite() || kw < 0.0 {
            return Err(EmsError::out_of_range("capacity", kw, 0.0, f64::INFINITY));
        }
        let mut state = self.state.lock();
        state.capacity_kw = kw;
        state.thresholds = Thresholds::compute(kw, self.cfg.reservoir_capacity_kwh);
        info!(capacity_kw = kw, "FCR-N capacity updated");
        Ok(())
    }

    /// Droop is stored for configuration and telemetry; the activation
    /// gain is fixed by the deadband.
    pub fn set_droop(&self, percent: f64) -> Result<()> {
        if !percent.is_finite() || percent <= 0.0 || percent > 100.0 {
            return Err(EmsError::out_of_range("droop", percent, 0.0, 100.0));
        }
        self.state.lock().droop_percent = percent;
        info!(droop_percent = percent, "FCR-N droop updated");
        Ok(())
    }

    /// Capacity actually maintainable around the current baseline.
    pub fn maintained_capacity(&self) -> f64 {
        let state = self.state.lock();
        (self.cfg.max_power_kw - state.baseline_kw)
            .min(state.baseline_kw - self.cfg.min_power_kw)
            .min(state.capacity_kw)
            .max(0.0)
    }

    pub fn status(&self) -> FcrnStatus {
        let state = self.state.lock();
        FcrnStatus {
            enabled: self.started.load(Ordering::SeqCst),
            active: state.active,
            nem_active: state.nem_active,
            aem_active: state.aem_side != AemSide::None,
            f_measured_hz: state.f_measured,
            f_reference_hz: state.f_reference,
            activated_power_kw: state.activated_power_kw,
            baseline_kw: state.baseline_kw,
            nem_power_kw: state.nem_power_kw,
            total_power_kw: state.total_power_kw,
            capacity_kw: state.capacity_kw,
            droop_percent: state.droop_percent,
            soc_percent: state.soc_percent,
            endurance_up_min: state.endurance_up_min,
            endurance_down_min: state.endurance_down_min,
            nem_current: state.nem_current,
            last_update: state.last_update,
        }
    }

    async fn tick(&self) {
        let outcome = {
            let mut state = self.state.lock();
            step(
                &mut state,
                Instant::now(),
                self.cfg.enable_energy_management,
                self.cfg.reservoir_capacity_kwh,
            )
        };
        match outcome {
            StepOutcome::Inactive => {}
            StepOutcome::StaleFrequency => {
                warn!("frequency source stale, skipping FCR-N tick");
            }
            StepOutcome::Output(kw) => self.sink.send_power(kw).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // capacity 1000 kW, reservoir 5000 kWh:
    //   enable_nem_low = 0.1, disable_nem_low ~= 0.1917
    //   enable_nem_high = 0.9, disable_nem_high ~= 0.8083
    //   enable_aem_low ~= 0.0167, disable_aem_low ~= 0.0333
    const CAPACITY: f64 = 1000.0;
    const RESERVOIR: f64 = 5000.0;

    fn state() -> FcrnState {
        let mut s = FcrnState::new(CAPACITY, 4.0, RESERVOIR);
        s.active = true;
        s
    }

    fn fresh(state: &mut FcrnState, now: Instant, hz: f64) {
        state.f_measured = hz;
        state.last_frequency_update = Some(now);
    }

    fn output(outcome: StepOutcome) -> f64 {
        match outcome {
            StepOutcome::Output(kw) => kw,
            other => panic!("expected output, got {:?}", other),
        }
    }

    #[test]
    fn inactive_controller_produces_nothing() {
        let mut s = state();
        s.active = false;
        let now = Instant::now();
        assert_eq!(step(&mut s, now, true, RESERVOIR), StepOutcome::Inactive);
    }

    #[test]
    fn stale_frequency_skips_the_tick() {
        let mut s = state();
        let now = Instant::now();
        s.f_measured = 49.95;
        s.last_frequency_update = Some(now - Duration::from_secs(6));
        assert_eq!(
            step(&mut s, now, true, RESERVOIR),
            StepOutcome::StaleFrequency
        );

        s.last_frequency_update = None;
        assert_eq!(
            step(&mut s, now, true, RESERVOIR),
            StepOutcome::StaleFrequency
        );
    }

    #[test]
    fn linear_activation_follows_the_deadband_gain() {
        let now = Instant::now();

        let mut s = state();
        fresh(&mut s, now, 49.95);
        assert!((output(step(&mut s, now, true, RESERVOIR)) - 500.0).abs() < 1e-9);

        let mut s = state();
        fresh(&mut s, now, 49.85);
        assert!((output(step(&mut s, now, true, RESERVOIR)) - 1000.0).abs() < 1e-9);

        let mut s = state();
        fresh(&mut s, now, 50.10);
        assert!((output(step(&mut s, now, true, RESERVOIR)) - (-1000.0)).abs() < 1e-9);
    }

    #[test]
    fn activated_power_never_exceeds_capacity() {
        let now = Instant::now();
        for hz in [49.5, 49.8, 49.9, 50.0, 50.1, 50.3] {
            let mut s = state();
            fresh(&mut s, now, hz);
            step(&mut s, now, true, RESERVOIR);
            assert!(s.activated_power_kw.abs() <= CAPACITY + 1e-9);
        }
    }

    #[test]
    fn nem_ramps_at_one_three_hundredth_per_sample() {
        let mut s = state();
        s.soc_percent = 5.0; // below enable_nem_low
        let base = Instant::now();
        for i in 0..60u64 {
            let now = base + Duration::from_secs(i);
            fresh(&mut s, now, 50.0);
            step(&mut s, now, true, RESERVOIR);
        }
        assert_eq!(s.nem_history.len(), 60);
        assert!((s.nem_current - (-0.2)).abs() < 1e-9);
        assert!(s.nem_active);

        // After a full window the average saturates at -1.
        for i in 60..300u64 {
            let now = base + Duration::from_secs(i);
            fresh(&mut s, now, 50.0);
            step(&mut s, now, true, RESERVOIR);
        }
        assert_eq!(s.nem_history.len(), WINDOW);
        assert!((s.nem_current - (-1.0)).abs() < 1e-9);

        // Switching back to idle decays by 1/300 per sample.
        s.soc_percent = 50.0;
        let now = base + Duration::from_secs(300);
        fresh(&mut s, now, 50.0);
        step(&mut s, now, true, RESERVOIR);
        assert!((s.nem_current - (-299.0 / 300.0)).abs() < 1e-9);
    }

    #[test]
    fn nem_samples_are_at_least_one_second_apart() {
        let mut s = state();
        s.soc_percent = 5.0;
        let base = Instant::now();
        fresh(&mut s, base, 50.0);
        step(&mut s, base, true, RESERVOIR);
        // 200 ms later: no new sample.
        let now = base + Duration::from_millis(200);
        fresh(&mut s, now, 50.0);
        step(&mut s, now, true, RESERVOIR);
        assert_eq!(s.nem_history.len(), 1);
    }

    #[test]
    fn nem_clears_outside_the_standard_band() {
        let mut s = state();
        s.soc_percent = 5.0;
        let base = Instant::now();
        fresh(&mut s, base, 50.0);
        step(&mut s, base, true, RESERVOIR);
        assert_eq!(s.nem_direction, NemDirection::Charging);

        let now = base + Duration::from_secs(1);
        fresh(&mut s, now, 50.2); // outside the band
        step(&mut s, now, true, RESERVOIR);
        assert_eq!(s.nem_direction, NemDirection::Idle);
        assert_eq!(s.nem_history.back(), Some(&0.0));
    }

    #[test]
    fn nem_hysteresis_holds_until_disable_threshold() {
        let mut s = state();
        s.soc_percent = 5.0;
        let base = Instant::now();
        fresh(&mut s, base, 50.0);
        step(&mut s, base, true, RESERVOIR);
        assert_eq!(s.nem_direction, NemDirection::Charging);

        // SOC recovered past enable but below disable: still charging.
        s.soc_percent = 15.0; // 0.15: above 0.1, below 0.1917
        let now = base + Duration::from_secs(1);
        fresh(&mut s, now, 50.0);
        step(&mut s, now, true, RESERVOIR);
        assert_eq!(s.nem_direction, NemDirection::Charging);

        // Past disable: back to idle.
        s.soc_percent = 20.0;
        let now = base + Duration::from_secs(2);
        fresh(&mut s, now, 50.0);
        step(&mut s, now, true, RESERVOIR);
        assert_eq!(s.nem_direction, NemDirection::Idle);
    }

    #[test]
    fn aem_reference_is_the_saturated_mean() {
        let mut s = state();
        s.soc_percent = 1.0; // below enable_aem_low -> AEM engages
        let base = Instant::now();
        for (i, hz) in [49.8, 50.2, 50.0].into_iter().enumerate() {
            let now = base + Duration::from_secs(i as u64);
            fresh(&mut s, now, hz);
            step(&mut s, now, true, RESERVOIR);
        }
        // saturated to [49.9, 50.1, 50.0]; mean = 50.0
        assert_eq!(s.aem_history.len(), 3);
        assert!((s.f_reference - 50.0).abs() < 1e-9);
        assert_eq!(s.aem_side, AemSide::Low);
    }

    #[test]
    fn aem_clears_history_when_inactive() {
        let mut s = state();
        s.soc_percent = 1.0;
        let base = Instant::now();
        fresh(&mut s, base, 49.95);
        step(&mut s, base, true, RESERVOIR);
        assert!(!s.aem_history.is_empty());

        // SOC recovers past the disable threshold (0.0333).
        s.soc_percent = 5.0;
        let now = base + Duration::from_secs(1);
        fresh(&mut s, now, 49.95);
        step(&mut s, now, true, RESERVOIR);
        assert_eq!(s.aem_side, AemSide::None);
        assert!(s.aem_history.is_empty());
        assert_eq!(s.f_reference, 49.95);
    }

    #[test]
    fn total_power_is_clamped_to_capacity_plus_nem_share() {
        let mut s = state();
        s.baseline_kw = 500.0;
        let now = Instant::now();
        fresh(&mut s, now, 49.8); // full positive activation
        let total = output(step(&mut s, now, true, RESERVOIR));
        assert!((total - CAPACITY * 1.1).abs() < 1e-9);
    }

    #[test]
    fn endurance_is_zero_at_the_aem_floor() {
        let mut s = state();
        s.soc_percent = 1.0;
        let now = Instant::now();
        fresh(&mut s, now, 50.0);
        step(&mut s, now, true, RESERVOIR);
        assert_eq!(s.endurance_up_min, 0.0);
        assert!(s.endurance_down_min > 0.0);
    }

    #[test]
    fn endurance_uses_sentinel_when_no_drain() {
        let mut s = state();
        s.soc_percent = 50.0;
        let now = Instant::now();
        fresh(&mut s, now, 50.1); // total = -C, so drain = 0
        step(&mut s, now, true, RESERVOIR);
        assert_eq!(s.endurance_up_min, ENDURANCE_SENTINEL_MIN);
    }

    #[test]
    fn endurance_matches_energy_over_drain() {
        let mut s = state();
        s.soc_percent = 50.0; // 2500 kWh in reservoir
        let now = Instant::now();
        fresh(&mut s, now, 50.0); // total = 0, drain = capacity
        step(&mut s, now, true, RESERVOIR);
        // 2500 kWh / 1000 kW * 60 = 150 min
        assert!((s.endurance_up_min - 150.0).abs() < 1e-9);
        assert!((s.endurance_down_min - 150.0).abs() < 1e-9);
    }

    struct RecordingSink {
        sent: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl PowerSink for RecordingSink {
        async fn send_power(&self, kw: f64) {
            self.sent.lock().push(kw);
        }
    }

    fn controller() -> (Arc<FcrnController>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let cfg = FcrnConfig {
            capacity_kw: CAPACITY,
            reservoir_capacity_kwh: RESERVOIR,
            min_power_kw: -1000.0,
            max_power_kw: 1000.0,
            ..FcrnConfig::default()
        };
        let controller = FcrnController::new(cfg, sink.clone() as _).unwrap();
        (controller, sink)
    }

    #[tokio::test]
    async fn tick_emits_through_the_sink() {
        let (controller, sink) = controller();
        controller.activate();
        controller.update_frequency(49.95);
        controller.update_soc(50.0);
        controller.tick().await;
        assert_eq!(sink.sent.lock().as_slice(), &[500.0]);
    }

    #[tokio::test]
    async fn deactivate_returns_to_baseline_and_resets() {
        let (controller, sink) = controller();
        controller.activate();
        controller.update_baseline(42.0);
        controller.update_frequency(49.95);
        controller.tick().await;

        controller.deactivate().await;
        assert_eq!(sink.sent.lock().last(), Some(&42.0));
        let status = controller.status();
        assert!(!status.active);
        assert_eq!(status.f_reference_hz, F_NOMINAL);
        assert_eq!(status.nem_current, 0.0);
    }

    #[tokio::test]
    async fn capacity_and_droop_validation() {
        let (controller, _) = controller();
        assert!(controller.set_capacity(-1.0).is_err());
        assert!(controller.set_capacity(500.0).is_ok());
        assert!(controller.set_droop(0.0).is_err());
        assert!(controller.set_droop(101.0).is_err());
        assert!(controller.set_droop(4.0).is_ok());
        assert_eq!(controller.status().capacity_kw, 500.0);
    }

    #[tokio::test]
    async fn maintained_capacity_shrinks_with_baseline() {
        let (controller, _) = controller();
        assert_eq!(controller.maintained_capacity(), 1000.0);
        controller.update_baseline(400.0);
        // min(1000 - 400, 400 - (-1000), 1000) = 600
        assert_eq!(controller.maintained_capacity(), 600.0);
        controller.update_baseline(-1200.0);
        assert_eq!(controller.maintained_capacity(), 0.0);
    }

    #[tokio::test]
    async fn soc_updates_are_clamped_to_percent_range() {
        let (controller, _) = controller();
        controller.update_soc(140.0);
        assert_eq!(controller.status().soc_percent, 100.0);
        controller.update_soc(-5.0);
        assert_eq!(controller.status().soc_percent, 0.0);
    }
}
