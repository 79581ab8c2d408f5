//! Mode state machine, safety interlocks and the manual power envelope.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

use crate::config::ControlConfig;
use crate::devices::bms::{BatteryStatus, BatteryTelemetry};
use crate::devices::pcs::PcsCommandState;
use crate::error::{EmsError, Result};

/// Operating mode. Initial mode is MANUAL.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Mode {
    Auto,
    Manual,
    Maintenance,
    SelfConsumption,
}

/// Minimal plant capability the control logic depends on. The managers
/// stand behind this seam so control and device layers stay acyclic.
#[async_trait]
pub trait ControlPlant: Send + Sync {
    fn pcs_ids(&self) -> Vec<u16>;
    async fn battery(&self, id: u16) -> Option<BatteryTelemetry>;
    async fn pcs_command(&self, id: u16) -> Option<PcsCommandState>;
    async fn set_active_power(&self, id: u16, kw: f64) -> Result<()>;
    async fn set_reactive_power(&self, id: u16, kvar: f64) -> Result<()>;
}

/// Last manual power setpoint accepted by the control logic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivePowerControl {
    pub enabled: bool,
    pub power_kw: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Charge-side ramp: tapers to 0 over the 5 SOC points below `max_soc`.
pub fn ramp_down(soc: f64, max_soc: f64) -> f64 {
    if soc > max_soc - 5.0 {
        ((max_soc - soc) / 5.0).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Discharge-side ramp: tapers to 0 over the 5 SOC points above `min_soc`.
pub fn ramp_up(soc: f64, min_soc: f64) -> f64 {
    if soc < min_soc + 5.0 {
        ((soc - min_soc) / 5.0).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Clamp a requested power (negative = charge) against the SOC-ramped
/// envelope formed by the device limits and the configured limits.
fn clamp_to_envelope(requested_kw: f64, battery: &BatteryTelemetry, limits: &ControlConfig) -> f64 {
    if requested_kw < 0.0 {
        let limit = battery
            .max_charge_power_kw
            .min(limits.max_charge_power_kw)
            * ramp_down(battery.soc_percent, limits.max_soc_percent);
        requested_kw.max(-limit)
    } else if requested_kw > 0.0 {
        let limit = battery
            .max_discharge_power_kw
            .min(limits.max_discharge_power_kw)
            * ramp_up(battery.soc_percent, limits.min_soc_percent);
        requested_kw.min(limit)
    } else {
        0.0
    }
}

pub struct ControlLogic {
    plant: Arc<dyn ControlPlant>,
    limits: ControlConfig,
    mode: RwLock<Mode>,
    active_power_control: RwLock<ActivePowerControl>,
}

impl ControlLogic {
    pub fn new(plant: Arc<dyn ControlPlant>, limits: ControlConfig) -> Self {
        Self {
            plant,
            limits,
            mode: RwLock::new(Mode::Manual),
            active_power_control: RwLock::new(ActivePowerControl::default()),
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    /// Unconditional mode transition.
    pub fn set_mode(&self, mode: Mode) {
        let old = {
            let mut guard = self.mode.write();
            std::mem::replace(&mut *guard, mode)
        };
        info!(old = %old, new = %mode, "control mode changed");
    }

    pub fn active_power_control(&self) -> ActivePowerControl {
        self.active_power_control.read().clone()
    }

    /// One control pass: enforce safety interlocks on every
    /// (PCS, battery-pair) group, then apply mode-specific policy.
    /// PCS `k` is paired with batteries `2k-1` and `2k`.
    pub async fn execute_control(&self) {
        for pcs_id in self.plant.pcs_ids() {
            if let Err(e) = self.enforce_group(pcs_id).await {
                warn!(unit = pcs_id, error = %e, "interlock enforcement failed");
            }
        }
        if self.mode() != Mode::Auto {
            return;
        }
        // In AUTO the grid-services layer owns dispatch; nothing beyond the
        // safety envelope happens here.
    }

    async fn enforce_group(&self, pcs_id: u16) -> Result<()> {
        let Some(cmd) = self.plant.pcs_command(pcs_id).await else {
            return Ok(());
        };

        let mut reasons: Vec<&'static str> = Vec::new();
        for battery_id in [2 * pcs_id - 1, 2 * pcs_id] {
            let Some(battery) = self.plant.battery(battery_id).await else {
                continue;
            };
            if battery.system_status == BatteryStatus::Fault {
                reasons.push("Fault");
            }
            if cmd.active_power_cmd_kw < 0.0
                && (battery.soc_percent >= self.limits.max_soc_percent
                    || battery.system_status == BatteryStatus::FullCharge)
            {
                reasons.push("MaxSOC during charging");
            }
            if cmd.active_power_cmd_kw > 0.0
                && (battery.soc_percent <= self.limits.min_soc_percent
                    || battery.system_status == BatteryStatus::FullDischarge)
            {
                reasons.push("MinSOC during discharging");
            }
        }
        if reasons.is_empty() {
            return Ok(());
        }
        reasons.dedup();
        let reason = reasons.join("; ");

        // An already-zero setpoint needs no re-write on every tick.
        if cmd.active_power_cmd_kw != 0.0 {
            warn!(unit = pcs_id, reason = %reason, "safety interlock zeroing active power");
            self.plant.set_active_power(pcs_id, 0.0).await?;
        }
        Ok(())
    }

    /// Manual active power command in kW (negative = charge). Allowed only
    /// in MANUAL mode; rejected while battery 1 reports Fault. The request
    /// is clamped against the SOC-ramped envelope and the clamped value is
    /// written. Returns the commanded value.
    pub async fn manual_power_command(&self, requested_kw: f64) -> Result<f64> {
        let mode = self.mode();
        if mode != Mode::Manual {
            return Err(EmsError::WrongMode { mode });
        }
        let battery = self.plant.battery(1).await.ok_or(EmsError::NotFound(1))?;
        if battery.system_status == BatteryStatus::Fault {
            return Err(EmsError::DeviceFault(1));
        }

        let commanded = clamp_to_envelope(requested_kw, &battery, &self.limits);
        self.plant.set_active_power(1, commanded).await?;

        let mut control = self.active_power_control.write();
        control.enabled = true;
        control.power_kw = commanded;
        control.last_updated = Some(Utc::now());
        info!(requested_kw, commanded_kw = commanded, "manual power command");
        Ok(commanded)
    }

    /// Manual reactive power command. Same gating as the active command;
    /// reactive power is never SOC-limited.
    pub async fn manual_reactive_power_command(&self, requested_kvar: f64) -> Result<()> {
        let mode = self.mode();
        if mode != Mode::Manual {
            return Err(EmsError::WrongMode { mode });
        }
        let battery = self.plant.battery(1).await.ok_or(EmsError::NotFound(1))?;
        if battery.system_status == BatteryStatus::Fault {
            return Err(EmsError::DeviceFault(1));
        }
        self.plant.set_reactive_power(1, requested_kvar).await?;
        info!(requested_kvar, "manual reactive power command");
        Ok(())
    }
}
