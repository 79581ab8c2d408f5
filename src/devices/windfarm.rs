//! Wind farm unit service. Each unit fronts one Farm Control Unit (FCU);
//! the manager aggregates across units.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DeviceEndpoint;
use crate::error::{EmsError, Result};
use crate::modbus::client::DeviceClient;
use crate::modbus::words::{decode_i16, decode_u16, encode_i16, fits_i16};
use crate::persistence::{PersistenceHandle, SampleBatch};

use super::{reconnect, run_heartbeat, sleep_until_boundary, UpdateSignal};

// Device register map.
const REG_TELEMETRY_BASE: u16 = 0;
const TELEMETRY_WORDS: u16 = 6;
const REG_HEARTBEAT: u16 = 50;
const REG_POWER_LIMIT: u16 = 100;

/// Commanded power limit scaling: kW x 10.
const POWER_LIMIT_SCALE: f64 = 10.0;
const POWER_LIMIT_KW: f64 = 1500.0;

#[derive(Debug, Clone, Serialize)]
pub struct WindFarmTelemetry {
    pub timestamp: DateTime<Utc>,
    pub active_power_kw: f64,
    pub reactive_power_kvar: f64,
    /// Power the farm could deliver at the present wind.
    pub possible_power_kw: f64,
    pub wind_speed_ms: f64,
    pub fcu_online: bool,
    pub turbine_count: u16,
}

impl Default for WindFarmTelemetry {
    fn default() -> Self {
        Self {
            timestamp: DateTime::UNIX_EPOCH,
            active_power_kw: 0.0,
            reactive_power_kvar: 0.0,
            possible_power_kw: 0.0,
            wind_speed_ms: 0.0,
            fcu_online: false,
            turbine_count: 0,
        }
    }
}

pub fn parse_windfarm_registers(words: &[u16], timestamp: DateTime<Utc>) -> WindFarmTelemetry {
    WindFarmTelemetry {
        timestamp,
        active_power_kw: decode_i16(words[0], 1.0),
        reactive_power_kvar: decode_i16(words[1], 1.0),
        possible_power_kw: decode_u16(words[2], 1.0),
        wind_speed_ms: decode_u16(words[3], 10.0),
        fcu_online: words[4] != 0,
        turbine_count: words[5],
    }
}

/// Aggregate view over all wind farm units.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindFarmSummary {
    pub total_active_power_kw: f64,
    pub total_reactive_power_kvar: f64,
    pub total_possible_power_kw: f64,
    pub average_wind_speed_ms: f64,
    pub unit_count: usize,
    pub all_fcu_online: bool,
}

pub struct WindFarmService {
    cfg: DeviceEndpoint,
    client: Arc<DeviceClient>,
    cache: RwLock<WindFarmTelemetry>,
    update: UpdateSignal,
    persistence: PersistenceHandle,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl WindFarmService {
    pub fn new(cfg: DeviceEndpoint, persistence: PersistenceHandle) -> Result<Arc<Self>> {
        let addr = cfg
            .socket_addr()
            .map_err(|e| EmsError::ConfigInvalid(e.to_string()))?;
        let client = Arc::new(DeviceClient::new(
            addr,
            cfg.unit_id,
            cfg.request_timeout(),
            cfg.request_timeout(),
        ));
        Ok(Arc::new(Self {
            cfg,
            client,
            cache: RwLock::new(WindFarmTelemetry::default()),
            update: UpdateSignal::new(),
            persistence,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u16 {
        self.cfg.id
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EmsError::ConfigInvalid(format!(
                "windfarm service {} already started",
                self.cfg.id
            )));
        }
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.run_poll().await });

        tokio::spawn(run_heartbeat(
            Arc::clone(&self.client),
            REG_HEARTBEAT,
            self.cfg.heartbeat_interval(),
            self.cancel.child_token(),
        ));

        let persister = Arc::clone(self);
        tokio::spawn(async move { persister.run_persist().await });
        info!(unit = self.cfg.id, "windfarm service started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.client.disconnect().await;
        info!(unit = self.cfg.id, "windfarm service stopped");
    }

    async fn run_poll(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.client.is_connected() {
                if !reconnect(&self.client, self.cfg.reconnect_delay(), &self.cancel).await {
                    break;
                }
                continue;
            }
            if let Err(e) = self.poll_once().await {
                warn!(unit = self.cfg.id, error = %e, "windfarm poll cycle failed");
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let words = self
            .client
            .read_holding(REG_TELEMETRY_BASE, TELEMETRY_WORDS)
            .await?;
        let parsed = parse_windfarm_registers(&words, Utc::now());
        *self.cache.write().await = parsed;
        self.update.notify();
        Ok(())
    }

    async fn run_persist(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until_boundary(self.cfg.persist_interval()) => {}
            }
            let snapshot = self.cache.read().await.clone();
            if snapshot.timestamp == DateTime::UNIX_EPOCH {
                continue;
            }
            self.persistence.offer(SampleBatch {
                source: format!("windfarm{}", self.cfg.id),
                timestamp: snapshot.timestamp,
                points: vec![
                    ("active_power_kw", snapshot.active_power_kw),
                    ("reactive_power_kvar", snapshot.reactive_power_kvar),
                    ("possible_power_kw", snapshot.possible_power_kw),
                    ("wind_speed_ms", snapshot.wind_speed_ms),
                    ("fcu_online", snapshot.fcu_online as u8 as f64),
                ],
            });
        }
    }

    pub async fn telemetry(&self) -> WindFarmTelemetry {
        self.cache.read().await.clone()
    }

    /// Command a farm power limit in kW.
    pub async fn set_power_limit(&self, kw: f64) -> Result<()> {
        if !self.client.is_connected() {
            return Err(EmsError::NotConnected);
        }
        if !kw.is_finite() || kw.abs() > POWER_LIMIT_KW || !fits_i16(kw, POWER_LIMIT_SCALE) {
            return Err(EmsError::out_of_range(
                "power limit",
                kw,
                -POWER_LIMIT_KW,
                POWER_LIMIT_KW,
            ));
        }
        self.client
            .write_single(REG_POWER_LIMIT, encode_i16(kw, POWER_LIMIT_SCALE))
            .await?;
        info!(unit = self.cfg.id, power_kw = kw, "windfarm power limit commanded");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn publish_for_tests(&self, telemetry: WindFarmTelemetry) {
        *self.cache.write().await = telemetry;
        self.update.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reads_signed_power_and_scaled_wind_speed() {
        let words = [(-250i16) as u16, 40, 900, 127, 1, 12];
        let t = parse_windfarm_registers(&words, Utc::now());
        assert_eq!(t.active_power_kw, -250.0);
        assert_eq!(t.reactive_power_kvar, 40.0);
        assert_eq!(t.possible_power_kw, 900.0);
        assert_eq!(t.wind_speed_ms, 12.7);
        assert!(t.fcu_online);
        assert_eq!(t.turbine_count, 12);
    }

    #[tokio::test]
    async fn power_limit_requires_connection() {
        let cfg = DeviceEndpoint {
            id: 1,
            host: "127.0.0.1".to_string(),
            port: 1502,
            unit_id: 1,
            poll_interval_ms: 200,
            heartbeat_interval_ms: 1000,
            persist_interval_s: 60,
            reconnect_delay_ms: 500,
            request_timeout_ms: 500,
            rack_count: 1,
        };
        let persistence = crate::persistence::spawn_persistence_worker(
            Arc::new(crate::persistence::LoggingSink),
            16,
            CancellationToken::new(),
        );
        let svc = WindFarmService::new(cfg, persistence).unwrap();
        assert!(matches!(
            svc.set_power_limit(100.0).await,
            Err(EmsError::NotConnected)
        ));
    }
}
