//! Protection equipment (PLC): switchgear positions and protection-relay
//! status, plus circuit-breaker commands.

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
use crate::persistence::{PersistenceHandle, SampleBatch};

use super::{reconnect, run_heartbeat, sleep_until_boundary, UpdateSignal};

// Device register map.
const REG_BREAKER_BASE: u16 = 0; // aux/MV word, PCS word, battery word, relay word
const BREAKER_WORDS: u16 = 4;
const REG_HEARTBEAT: u16 = 50;
const REG_CB_CMD_BASE: u16 = 100;

const BIT_AUX_BREAKER: u16 = 1 << 0;
const BIT_MV_BREAKER: u16 = 1 << 1;

/// Breakers addressable through the command block. The command register is
/// `REG_CB_CMD_BASE + offset`, value 1 = close, 0 = open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKind {
    Auxiliary,
    MediumVoltage,
    Pcs(u16),
    Battery(u16),
}

impl BreakerKind {
    fn command_offset(self) -> u16 {
        match self {
            Self::Auxiliary => 0,
            Self::MediumVoltage => 1,
            // Unit-indexed breakers start after the two station breakers.
            Self::Pcs(unit) => 1 + unit,
            Self::Battery(unit) => 17 + unit,
        }
    }
}

/// Parsed switchgear and relay state, one capture timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectionTelemetry {
    pub timestamp: DateTime<Utc>,
    pub aux_breaker_closed: bool,
    pub mv_breaker_closed: bool,
    /// Bit `n` = breaker of PCS unit `n + 1` closed.
    pub pcs_breakers: u16,
    /// Bit `n` = breaker of battery unit `n + 1` closed.
    pub battery_breakers: u16,
    /// Raw protection-relay fault bits.
    pub relay_faults: u16,
}

impl Default for ProtectionTelemetry {
    fn default() -> Self {
        Self {
            timestamp: DateTime::UNIX_EPOCH,
            aux_breaker_closed: false,
            mv_breaker_closed: false,
            pcs_breakers: 0,
            battery_breakers: 0,
            relay_faults: 0,
        }
    }
}

impl ProtectionTelemetry {
    pub fn pcs_breaker_closed(&self, unit: u16) -> bool {
        unit >= 1 && self.pcs_breakers & (1 << (unit - 1)) != 0
    }

    pub fn battery_breaker_closed(&self, unit: u16) -> bool {
        unit >= 1 && self.battery_breakers & (1 << (unit - 1)) != 0
    }

    pub fn relay_fault_active(&self) -> bool {
        self.relay_faults != 0
    }
}

pub fn parse_protection_registers(words: &[u16], timestamp: DateTime<Utc>) -> ProtectionTelemetry {
    ProtectionTelemetry {
        timestamp,
        aux_breaker_closed: words[0] & BIT_AUX_BREAKER != 0,
        mv_breaker_closed: words[0] & BIT_MV_BREAKER != 0,
        pcs_breakers: words[1],
        battery_breakers: words[2],
        relay_faults: words[3],
    }
}

/// Protection equipment service: poll, heartbeat, persistence, breaker
/// commands. Only its poll loop mutates the breaker state cache.
pub struct PlcService {
    cfg: DeviceEndpoint,
    client: Arc<DeviceClient>,
    cache: RwLock<ProtectionTelemetry>,
    update: UpdateSignal,
    persistence: PersistenceHandle,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl PlcService {
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
            cache: RwLock::new(ProtectionTelemetry::default()),
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
            return Err(EmsError::ConfigInvalid(
                "plc service already started".to_string(),
            ));
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
        info!("plc service started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.client.disconnect().await;
        info!("plc service stopped");
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
                warn!(error = %e, "plc poll cycle failed");
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let words = self
            .client
            .read_holding(REG_BREAKER_BASE, BREAKER_WORDS)
            .await?;
        let parsed = parse_protection_registers(&words, Utc::now());
        if parsed.relay_fault_active() {
            warn!(relay_faults = parsed.relay_faults, "protection relay fault bits set");
        }
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
                source: "plc".to_string(),
                timestamp: snapshot.timestamp,
                points: vec![
                    ("aux_breaker_closed", snapshot.aux_breaker_closed as u8 as f64),
                    ("mv_breaker_closed", snapshot.mv_breaker_closed as u8 as f64),
                    ("pcs_breakers", snapshot.pcs_breakers as f64),
                    ("battery_breakers", snapshot.battery_breakers as f64),
                    ("relay_faults", snapshot.relay_faults as f64),
                ],
            });
        }
    }

    pub async fn telemetry(&self) -> ProtectionTelemetry {
        self.cache.read().await.clone()
    }

    pub async fn set_breaker(&self, breaker: BreakerKind, close: bool) -> Result<()> {
        if !self.client.is_connected() {
            return Err(EmsError::NotConnected);
        }
        let register = REG_CB_CMD_BASE + breaker.command_offset();
        self.client
            .write_single(register, if close { 1 } else { 0 })
            .await?;
        info!(?breaker, close, "circuit breaker commanded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_bits_decode_per_unit() {
        // aux closed, MV open; PCS 1 and 3 closed; battery 2 closed.
        let words = [0b01u16, 0b101, 0b010, 0];
        let t = parse_protection_registers(&words, Utc::now());
        assert!(t.aux_breaker_closed);
        assert!(!t.mv_breaker_closed);
        assert!(t.pcs_breaker_closed(1));
        assert!(!t.pcs_breaker_closed(2));
        assert!(t.pcs_breaker_closed(3));
        assert!(t.battery_breaker_closed(2));
        assert!(!t.battery_breaker_closed(1));
        assert!(!t.relay_fault_active());
    }

    #[test]
    fn relay_fault_bits_raise_flag() {
        let words = [0u16, 0, 0, 0x0004];
        let t = parse_protection_registers(&words, Utc::now());
        assert!(t.relay_fault_active());
    }

    #[test]
    fn command_offsets_do_not_collide() {
        let mut offsets = vec![
            BreakerKind::Auxiliary.command_offset(),
            BreakerKind::MediumVoltage.command_offset(),
        ];
        for unit in 1..=16 {
            offsets.push(BreakerKind::Pcs(unit).command_offset());
            offsets.push(BreakerKind::Battery(unit).command_offset());
        }
        let len = offsets.len();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), len);
    }

    #[tokio::test]
    async fn breaker_command_requires_connection() {
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
        let svc = PlcService::new(cfg, persistence).unwrap();
        assert!(matches!(
            svc.set_breaker(BreakerKind::Pcs(1), true).await,
            Err(EmsError::NotConnected)
        ));
    }
}
