//! Application wiring: builds the device services, managers, control logic
//! and FCR-N service from configuration, and owns the shared lifecycle
//! token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alarms::AlarmManager;
use crate::config::AppConfig;
use crate::control::{spawn_control_driver, ControlLogic, ControlPlant};
use crate::devices::bms::{BatteryTelemetry, BmsService};
use crate::devices::manager::{BmsManager, PcsManager, WindFarmManager};
use crate::devices::pcs::{PcsCommandState, PcsService};
use crate::devices::plc::PlcService;
use crate::devices::windfarm::WindFarmService;
use crate::error::{EmsError, Result};
use crate::fcrn::{FcrnService, FrequencySource, PcsPowerSink};
use crate::persistence::{spawn_persistence_worker, LoggingSink, PersistenceHandle};

/// Managers seen through the control logic's capability seam.
struct EmsPlant {
    bms: Arc<BmsManager>,
    pcs: Arc<PcsManager>,
}

#[async_trait]
impl ControlPlant for EmsPlant {
    fn pcs_ids(&self) -> Vec<u16> {
        self.pcs.ids()
    }

    async fn battery(&self, id: u16) -> Option<BatteryTelemetry> {
        let service = self.bms.get(id)?;
        Some(service.telemetry().await)
    }

    async fn pcs_command(&self, id: u16) -> Option<PcsCommandState> {
        let service = self.pcs.get(id)?;
        Some(service.command_state().await)
    }

    async fn set_active_power(&self, id: u16, kw: f64) -> Result<()> {
        let service = self.pcs.get(id).ok_or(EmsError::NotFound(id))?;
        service.set_active_power(kw).await
    }

    async fn set_reactive_power(&self, id: u16, kvar: f64) -> Result<()> {
        let service = self.pcs.get(id).ok_or(EmsError::NotFound(id))?;
        service.set_reactive_power(kvar).await
    }
}

/// Aggregate health view for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub bms_connected: usize,
    pub bms_total: usize,
    pub pcs_connected: usize,
    pub pcs_total: usize,
    pub plc_connected: bool,
    pub windfarm_connected: usize,
    pub windfarm_total: usize,
    pub active_alarms: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: AppConfig,
    pub bms: Arc<BmsManager>,
    pub pcs: Arc<PcsManager>,
    pub plc: Option<Arc<PlcService>>,
    pub windfarm: Arc<WindFarmManager>,
    pub control: Arc<ControlLogic>,
    pub fcrn: Arc<FcrnService>,
    pub alarms: Arc<AlarmManager>,
    pub persistence: PersistenceHandle,
    pub cancel: CancellationToken,
}

impl AppState {
    pub async fn new(cfg: AppConfig) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let alarms = Arc::new(AlarmManager::new());
        let persistence = spawn_persistence_worker(
            Arc::new(LoggingSink),
            cfg.persistence.queue_depth,
            cancel.child_token(),
        );

        let bms_services: Vec<Arc<BmsService>> = cfg
            .bms
            .iter()
            .map(|endpoint| {
                BmsService::new(endpoint.clone(), Arc::clone(&alarms), persistence.clone())
            })
            .collect::<Result<_>>()?;
        let bms = Arc::new(BmsManager::new(bms_services));

        let pcs_services: Vec<Arc<PcsService>> = cfg
            .pcs
            .iter()
            .map(|endpoint| {
                PcsService::new(endpoint.clone(), Arc::clone(&alarms), persistence.clone())
            })
            .collect::<Result<_>>()?;
        let pcs = Arc::new(PcsManager::new(pcs_services));

        let plc = cfg
            .plc
            .as_ref()
            .map(|endpoint| PlcService::new(endpoint.clone(), persistence.clone()))
            .transpose()?;

        let windfarm_services: Vec<Arc<WindFarmService>> = cfg
            .windfarm
            .iter()
            .map(|endpoint| WindFarmService::new(endpoint.clone(), persistence.clone()))
            .collect::<Result<_>>()?;
        let windfarm = Arc::new(WindFarmManager::new(windfarm_services));

        let plant = Arc::new(EmsPlant {
            bms: Arc::clone(&bms),
            pcs: Arc::clone(&pcs),
        });
        let control = Arc::new(ControlLogic::new(plant, cfg.control.clone()));

        let frequency_source: Arc<dyn FrequencySource> = Arc::new(
            crate::fcrn::PcsFrequencySource::new(Arc::clone(&pcs), cfg.fcrn.pcs_number),
        );
        let power_sink = Arc::new(PcsPowerSink::new(Arc::clone(&pcs), cfg.fcrn.capacity_kw));
        let fcrn = FcrnService::new(
            cfg.fcrn.clone(),
            frequency_source,
            power_sink,
            Arc::clone(&bms),
        )?;

        Ok(Self {
            cfg,
            bms,
            pcs,
            plc,
            windfarm,
            control,
            fcrn,
            alarms,
            persistence,
            cancel,
        })
    }

    /// Start device services, the control driver and the FCR-N service.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.bms.start_all()?;
        self.pcs.start_all()?;
        if let Some(plc) = &self.plc {
            plc.start()?;
        }
        self.windfarm.start_all()?;

        let update_rxs = self
            .bms
            .all()
            .into_iter()
            .filter_map(|service| service.take_update_receiver())
            .collect();
        spawn_control_driver(
            Arc::clone(&self.control),
            update_rxs,
            Duration::from_millis(self.cfg.control.tick_ms),
            self.cancel.child_token(),
        );

        self.fcrn.start()?;
        info!(
            bms = self.bms.len(),
            pcs = self.pcs.len(),
            windfarm = self.windfarm.len(),
            "EMS started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.fcrn.stop().await;
        self.bms.stop_all().await;
        self.pcs.stop_all().await;
        if let Some(plc) = &self.plc {
            plc.stop().await;
        }
        self.windfarm.stop_all().await;
        info!("EMS shut down");
    }

    pub fn health(&self) -> HealthReport {
        let bms_connected = self.bms.connected_units();
        let pcs_connected = self.pcs.connected_units();
        let device_total = self.bms.len() + self.pcs.len();
        let device_connected = bms_connected + pcs_connected;
        HealthReport {
            // Unhealthy when configured devices exist but none respond.
            healthy: device_total == 0 || device_connected > 0,
            bms_connected,
            bms_total: self.bms.len(),
            pcs_connected,
            pcs_total: self.pcs.len(),
            plc_connected: self.plc.as_ref().map(|p| p.is_connected()).unwrap_or(false),
            windfarm_connected: self.windfarm.connected_units(),
            windfarm_total: self.windfarm.len(),
            active_alarms: self.alarms.active_count(),
        }
    }
}
