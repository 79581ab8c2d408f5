//! Battery management system unit: telemetry model, register layout,
//! polling service and commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::Display;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alarms::{codes, AlarmManager};
use crate::config::DeviceEndpoint;
use crate::error::{EmsError, Result};
use crate::modbus::client::DeviceClient;
use crate::modbus::words::{decode_i16, decode_u16, encode_i16, encode_u16, join_u32, split_u32};
use crate::persistence::{PersistenceHandle, SampleBatch};

use super::{reconnect, run_heartbeat, sleep_until_boundary, UpdateSignal};

// Device register map. The telemetry block mirrors the image the external
// register server republishes, so one layout serves both directions.
const REG_TELEMETRY_BASE: u16 = 0;
const REG_RACK_BASE: u16 = 100;
const REG_FAULT_BASE: u16 = 300;
const REG_WARN_BASE: u16 = 310;
const REG_HEARTBEAT: u16 = 500;
const REG_RESET: u16 = 510;
const REG_BREAKER: u16 = 511;

pub const BATTERY_IMAGE_LEN: u16 = 41;
pub const RACK_IMAGE_LEN: u16 = 10;
const FAULT_WORDS: u16 = 2;
const WARN_WORDS: u16 = 1;

/// Derived battery state reported by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "PascalCase")]
pub enum BatteryStatus {
    Idle,
    Charging,
    Discharging,
    FullCharge,
    FullDischarge,
    Fault,
    Unknown,
}

impl BatteryStatus {
    pub fn from_register(word: u16) -> Self {
        match word {
            0 => Self::Idle,
            1 => Self::Charging,
            2 => Self::Discharging,
            3 => Self::FullCharge,
            4 => Self::FullDischarge,
            5 => Self::Fault,
            _ => Self::Unknown,
        }
    }

    pub fn to_register(self) -> u16 {
        match self {
            Self::Idle => 0,
            Self::Charging => 1,
            Self::Discharging => 2,
            Self::FullCharge => 3,
            Self::FullDischarge => 4,
            Self::Fault => 5,
            Self::Unknown => 6,
        }
    }
}

/// Per-rack state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "PascalCase")]
pub enum RackState {
    Offline,
    Standby,
    Online,
    Fault,
    Unknown,
}

impl RackState {
    fn from_register(word: u16) -> Self {
        match word {
            0 => Self::Offline,
            1 => Self::Standby,
            2 => Self::Online,
            3 => Self::Fault,
            _ => Self::Unknown,
        }
    }

    fn to_register(self) -> u16 {
        match self {
            Self::Offline => 0,
            Self::Standby => 1,
            Self::Online => 2,
            Self::Fault => 3,
            Self::Unknown => 4,
        }
    }
}

/// Full battery unit telemetry, one capture timestamp for every field.
#[derive(Debug, Clone, Serialize)]
pub struct BatteryTelemetry {
    pub timestamp: DateTime<Utc>,
    pub voltage_v: f64,
    pub current_a: f64,
    pub soc_percent: f64,
    pub soh_percent: f64,
    pub max_cell_voltage_v: f64,
    pub min_cell_voltage_v: f64,
    pub avg_cell_voltage_v: f64,
    pub max_cell_temp_c: f64,
    pub min_cell_temp_c: f64,
    pub avg_cell_temp_c: f64,
    pub max_charge_current_a: f64,
    pub max_discharge_current_a: f64,
    pub max_charge_power_kw: f64,
    pub max_discharge_power_kw: f64,
    pub power_kw: f64,
    pub charge_capacity_kwh: f64,
    pub discharge_capacity_kwh: f64,
    pub max_charge_voltage_v: f64,
    pub max_discharge_voltage_v: f64,
    pub insulation_pos_kohm: f64,
    pub insulation_neg_kohm: f64,
    pub system_status: BatteryStatus,
}

impl Default for BatteryTelemetry {
    fn default() -> Self {
        Self {
            timestamp: DateTime::UNIX_EPOCH,
            voltage_v: 0.0,
            current_a: 0.0,
            soc_percent: 0.0,
            soh_percent: 0.0,
            max_cell_voltage_v: 0.0,
            min_cell_voltage_v: 0.0,
            avg_cell_voltage_v: 0.0,
            max_cell_temp_c: 0.0,
            min_cell_temp_c: 0.0,
            avg_cell_temp_c: 0.0,
            max_charge_current_a: 0.0,
            max_discharge_current_a: 0.0,
            max_charge_power_kw: 0.0,
            max_discharge_power_kw: 0.0,
            power_kw: 0.0,
            charge_capacity_kwh: 0.0,
            discharge_capacity_kwh: 0.0,
            max_charge_voltage_v: 0.0,
            max_discharge_voltage_v: 0.0,
            insulation_pos_kohm: 0.0,
            insulation_neg_kohm: 0.0,
            system_status: BatteryStatus::Unknown,
        }
    }
}

/// Rack telemetry, indexed 1..N externally.
#[derive(Debug, Clone, Serialize)]
pub struct RackTelemetry {
    pub index: u16,
    pub timestamp: DateTime<Utc>,
    pub state: RackState,
    pub voltage_v: f64,
    pub current_a: f64,
    pub max_cell_voltage_v: f64,
    pub min_cell_voltage_v: f64,
    pub max_cell_temp_c: f64,
    pub min_cell_temp_c: f64,
    pub soc_percent: f64,
}

/// Last locally-issued BMS commands, for the status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BmsCommandState {
    pub last_reset: Option<DateTime<Utc>>,
    pub breaker_close: Option<bool>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Decode the 41-word telemetry image.
pub fn parse_battery_registers(words: &[u16], timestamp: DateTime<Utc>) -> BatteryTelemetry {
    BatteryTelemetry {
        timestamp,
        voltage_v: decode_u16(words[0], 10.0),
        current_a: decode_i16(words[1], 1.0),
        soc_percent: decode_u16(words[2], 10.0),
        soh_percent: decode_u16(words[3], 10.0),
        max_cell_voltage_v: decode_u16(words[4], 1000.0),
        min_cell_voltage_v: decode_u16(words[5], 1000.0),
        avg_cell_voltage_v: decode_u16(words[6], 1000.0),
        max_cell_temp_c: decode_i16(words[7], 1.0),
        min_cell_temp_c: decode_i16(words[8], 1.0),
        avg_cell_temp_c: decode_i16(words[9], 1.0),
        max_charge_current_a: decode_u16(words[10], 1.0),
        max_discharge_current_a: decode_u16(words[11], 1.0),
        max_charge_power_kw: decode_u16(words[12], 1.0),
        max_discharge_power_kw: decode_u16(words[13], 1.0),
        power_kw: decode_i16(words[14], 1.0),
        charge_capacity_kwh: join_u32(words[15], words[16]) as f64,
        discharge_capacity_kwh: join_u32(words[17], words[18]) as f64,
        max_charge_voltage_v: decode_u16(words[19], 10.0),
        max_discharge_voltage_v: decode_u16(words[20], 10.0),
        insulation_pos_kohm: decode_u16(words[21], 1.0),
        insulation_neg_kohm: decode_u16(words[22], 1.0),
        system_status: BatteryStatus::from_register(words[23]),
    }
}

/// Render the 41-word telemetry image; words 24..=40 are reserved.
pub fn render_battery_registers(t: &BatteryTelemetry) -> [u16; BATTERY_IMAGE_LEN as usize] {
    let mut words = [0u16; BATTERY_IMAGE_LEN as usize];
    words[0] = encode_u16(t.voltage_v, 10.0);
    words[1] = encode_i16(t.current_a, 1.0);
    words[2] = encode_u16(t.soc_percent, 10.0);
    words[3] = encode_u16(t.soh_percent, 10.0);
    words[4] = encode_u16(t.max_cell_voltage_v, 1000.0);
    words[5] = encode_u16(t.min_cell_voltage_v, 1000.0);
    words[6] = encode_u16(t.avg_cell_voltage_v, 1000.0);
    words[7] = encode_i16(t.max_cell_temp_c, 1.0);
    words[8] = encode_i16(t.min_cell_temp_c, 1.0);
    words[9] = encode_i16(t.avg_cell_temp_c, 1.0);
    words[10] = encode_u16(t.max_charge_current_a, 1.0);
    words[11] = encode_u16(t.max_discharge_current_a, 1.0);
    words[12] = encode_u16(t.max_charge_power_kw, 1.0);
    words[13] = encode_u16(t.max_discharge_power_kw, 1.0);
    words[14] = encode_i16(t.power_kw, 1.0);
    let [hi, lo] = split_u32(t.charge_capacity_kwh.round().max(0.0) as u32);
    words[15] = hi;
    words[16] = lo;
    let [hi, lo] = split_u32(t.discharge_capacity_kwh.round().max(0.0) as u32);
    words[17] = hi;
    words[18] = lo;
    words[19] = encode_u16(t.max_charge_voltage_v, 10.0);
    words[20] = encode_u16(t.max_discharge_voltage_v, 10.0);
    words[21] = encode_u16(t.insulation_pos_kohm, 1.0);
    words[22] = encode_u16(t.insulation_neg_kohm, 1.0);
    words[23] = t.system_status.to_register();
    words
}

fn parse_rack_registers(index: u16, words: &[u16], timestamp: DateTime<Utc>) -> RackTelemetry {
    RackTelemetry {
        index,
        timestamp,
        state: RackState::from_register(words[0]),
        voltage_v: decode_u16(words[1], 10.0),
        current_a: decode_i16(words[2], 1.0),
        max_cell_voltage_v: decode_u16(words[3], 1000.0),
        min_cell_voltage_v: decode_u16(words[4], 1000.0),
        max_cell_temp_c: decode_i16(words[5], 1.0),
        min_cell_temp_c: decode_i16(words[6], 1.0),
        soc_percent: decode_u16(words[7], 10.0),
    }
}

#[derive(Default)]
struct BmsCache {
    telemetry: BatteryTelemetry,
    racks: Vec<RackTelemetry>,
    command: BmsCommandState,
}

/// One battery unit: owns the device client, the parsed telemetry cache
/// and the poll/heartbeat/persist tasks.
pub struct BmsService {
    cfg: DeviceEndpoint,
    client: Arc<DeviceClient>,
    cache: RwLock<BmsCache>,
    update: UpdateSignal,
    alarms: Arc<AlarmManager>,
    persistence: PersistenceHandle,
    cancel: CancellationToken,
    started: AtomicBool,
    source_fault: String,
    source_warning: String,
}

impl BmsService {
    pub fn new(
        cfg: DeviceEndpoint,
        alarms: Arc<AlarmManager>,
        persistence: PersistenceHandle,
    ) -> Result<Arc<Self>> {
        let addr = cfg
            .socket_addr()
            .map_err(|e| EmsError::ConfigInvalid(e.to_string()))?;
        let client = Arc::new(DeviceClient::new(
            addr,
            cfg.unit_id,
            cfg.request_timeout(),
            cfg.request_timeout(),
        ));
        let source_fault = format!("bms{}_fault", cfg.id);
        let source_warning = format!("bms{}_warning", cfg.id);
        Ok(Arc::new(Self {
            cfg,
            client,
            cache: RwLock::new(BmsCache::default()),
            update: UpdateSignal::new(),
            alarms,
            persistence,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            source_fault,
            source_warning,
        }))
    }

    pub fn id(&self) -> u16 {
        self.cfg.id
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn take_update_receiver(&self) -> Option<tokio::sync::mpsc::Receiver<()>> {
        self.update.take_receiver()
    }

    /// Spawn the poll, heartbeat and persistence tasks.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EmsError::ConfigInvalid(format!(
                "bms service {} already started",
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
        info!(unit = self.cfg.id, "bms service started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.client.disconnect().await;
        info!(unit = self.cfg.id, "bms service stopped");
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
                warn!(unit = self.cfg.id, error = %e, "bms poll cycle failed");
            }
        }
    }

    /// One poll cycle: read all telemetry regions, parse under a shared
    /// capture timestamp, swap atomically, signal the update channel.
    async fn poll_once(&self) -> Result<()> {
        let rack_words = self.cfg.rack_count * RACK_IMAGE_LEN;
        let (telemetry, racks, faults, warnings) = tokio::try_join!(
            self.client.read_holding(REG_TELEMETRY_BASE, BATTERY_IMAGE_LEN),
            self.client.read_holding(REG_RACK_BASE, rack_words),
            self.client.read_holding(REG_FAULT_BASE, FAULT_WORDS),
            self.client.read_holding(REG_WARN_BASE, WARN_WORDS),
        )?;

        let timestamp = Utc::now();
        let parsed = parse_battery_registers(&telemetry, timestamp);
        let parsed_racks: Vec<RackTelemetry> = racks
            .chunks(RACK_IMAGE_LEN as usize)
            .enumerate()
            .map(|(i, chunk)| parse_rack_registers(i as u16 + 1, chunk, timestamp))
            .collect();

        self.alarms
            .process(&self.source_fault, &codes::BMS_FAULTS, &faults);
        self.alarms
            .process(&self.source_warning, &codes::BMS_WARNINGS, &warnings);

        {
            let mut cache = self.cache.write().await;
            cache.telemetry = parsed;
            cache.racks = parsed_racks;
        }
        self.update.notify();
        Ok(())
    }

    async fn run_persist(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until_boundary(self.cfg.persist_interval()) => {}
            }
            let snapshot = self.cache.read().await.telemetry.clone();
            if snapshot.timestamp == DateTime::UNIX_EPOCH {
                continue;
            }
            self.persistence.offer(SampleBatch {
                source: format!("bms{}", self.cfg.id),
                timestamp: snapshot.timestamp,
                points: vec![
                    ("voltage_v", snapshot.voltage_v),
                    ("current_a", snapshot.current_a),
                    ("soc_percent", snapshot.soc_percent),
                    ("soh_percent", snapshot.soh_percent),
                    ("power_kw", snapshot.power_kw),
                    ("max_cell_voltage_v", snapshot.max_cell_voltage_v),
                    ("min_cell_voltage_v", snapshot.min_cell_voltage_v),
                    ("max_cell_temp_c", snapshot.max_cell_temp_c),
                    ("min_cell_temp_c", snapshot.min_cell_temp_c),
                    ("insulation_pos_kohm", snapshot.insulation_pos_kohm),
                    ("insulation_neg_kohm", snapshot.insulation_neg_kohm),
                ],
            });
        }
    }

    pub async fn telemetry(&self) -> BatteryTelemetry {
        self.cache.read().await.telemetry.clone()
    }

    pub async fn racks(&self) -> Vec<RackTelemetry> {
        self.cache.read().await.racks.clone()
    }

    pub async fn rack(&self, index: u16) -> Option<RackTelemetry> {
        self.cache
            .read()
            .await
            .racks
            .iter()
            .find(|r| r.index == index)
            .cloned()
    }

    pub async fn command_state(&self) -> BmsCommandState {
        self.cache.read().await.command.clone()
    }

    /// Snapshot the cache and render the external 41-word image.
    pub async fn register_image(&self) -> [u16; BATTERY_IMAGE_LEN as usize] {
        let cache = self.cache.read().await;
        render_battery_registers(&cache.telemetry)
    }

    pub async fn reset(&self) -> Result<()> {
        if !self.client.is_connected() {
            return Err(EmsError::NotConnected);
        }
        self.client.write_single(REG_RESET, 1).await?;
        let mut cache = self.cache.write().await;
        cache.command.last_reset = Some(Utc::now());
        cache.command.last_updated = Some(Utc::now());
        info!(unit = self.cfg.id, "bms reset commanded");
        Ok(())
    }

    pub async fn set_breaker(&self, close: bool) -> Result<()> {
        if !self.client.is_connected() {
            return Err(EmsError::NotConnected);
        }
        self.client
            .write_single(REG_BREAKER, if close { 1 } else { 0 })
            .await?;
        let mut cache = self.cache.write().await;
        cache.command.breaker_close = Some(close);
        cache.command.last_updated = Some(Utc::now());
        info!(unit = self.cfg.id, close, "bms breaker commanded");
        Ok(())
    }

    /// Test seam: install a parsed snapshot as if a poll cycle produced it.
    #[cfg(test)]
    pub(crate) async fn publish_for_tests(&self, telemetry: BatteryTelemetry) {
        let mut cache = self.cache.write().await;
        cache.telemetry = telemetry;
        drop(cache);
        self.update.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_telemetry() -> BatteryTelemetry {
        BatteryTelemetry {
            timestamp: Utc::now(),
            voltage_v: 850.0,
            current_a: 120.0,
            soc_percent: 75.3,
            soh_percent: 98.5,
            max_cell_voltage_v: 3.512,
            min_cell_voltage_v: 3.344,
            avg_cell_voltage_v: 3.401,
            max_cell_temp_c: 31.0,
            min_cell_temp_c: 24.0,
            avg_cell_temp_c: 27.0,
            max_charge_current_a: 260.0,
            max_discharge_current_a: 280.0,
            max_charge_power_kw: 400.0,
            max_discharge_power_kw: 420.0,
            power_kw: -150.0,
            charge_capacity_kwh: 120345.0,
            discharge_capacity_kwh: 118230.0,
            max_charge_voltage_v: 912.0,
            max_discharge_voltage_v: 700.0,
            insulation_pos_kohm: 1500.0,
            insulation_neg_kohm: 1480.0,
            system_status: BatteryStatus::Charging,
        }
    }

    #[test]
    fn render_produces_documented_scalings() {
        let words = render_battery_registers(&sample_telemetry());
        // voltage x10, current in A, soc x10
        assert_eq!(&words[0..3], &[8500, 120, 753]);
        assert_eq!(words[4], 3512); // cell voltage x1000
        assert_eq!(words[14] as i16, -150); // signed power
        assert_eq!(words[23], BatteryStatus::Charging.to_register());
    }

    #[test]
    fn parse_then_render_round_trips() {
        let original = render_battery_registers(&sample_telemetry());
        let parsed = parse_battery_registers(&original, Utc::now());
        let rendered = render_battery_registers(&parsed);
        assert_eq!(original, rendered);
    }

    #[test]
    fn capacity_counters_span_two_words_high_first() {
        let mut t = sample_telemetry();
        t.charge_capacity_kwh = 0x0001_0002 as f64;
        let words = render_battery_registers(&t);
        assert_eq!(words[15], 1);
        assert_eq!(words[16], 2);
        let parsed = parse_battery_registers(&words, Utc::now());
        assert_eq!(parsed.charge_capacity_kwh, 0x0001_0002 as f64);
    }

    #[test]
    fn unknown_status_word_maps_to_unknown() {
        assert_eq!(BatteryStatus::from_register(999), BatteryStatus::Unknown);
    }

    #[test]
    fn rack_parse_reads_one_based_index() {
        let words = [2u16, 8500, (-50i16) as u16, 3512, 3344, 31, 24, 753, 0, 0];
        let rack = parse_rack_registers(3, &words, Utc::now());
        assert_eq!(rack.index, 3);
        assert_eq!(rack.state, RackState::Online);
        assert_eq!(rack.current_a, -50.0);
        assert_eq!(rack.soc_percent, 75.3);
    }

    fn endpoint() -> DeviceEndpoint {
        DeviceEndpoint {
            id: 1,
            host: "127.0.0.1".to_string(),
            port: 1502,
            unit_id: 1,
            poll_interval_ms: 200,
            heartbeat_interval_ms: 1000,
            persist_interval_s: 60,
            reconnect_delay_ms: 500,
            request_timeout_ms: 500,
            rack_count: 2,
        }
    }

    fn service() -> Arc<BmsService> {
        let alarms = Arc::new(AlarmManager::new());
        let cancel = CancellationToken::new();
        let persistence = crate::persistence::spawn_persistence_worker(
            Arc::new(crate::persistence::LoggingSink),
            16,
            cancel,
        );
        BmsService::new(endpoint(), alarms, persistence).unwrap()
    }

    #[tokio::test]
    async fn commands_require_connection() {
        let svc = service();
        assert!(matches!(svc.reset().await, Err(EmsError::NotConnected)));
        assert!(matches!(
            svc.set_breaker(true).await,
            Err(EmsError::NotConnected)
        ));
        // Command state did not advance.
        assert!(svc.command_state().await.last_updated.is_none());
    }

    #[tokio::test]
    async fn update_channel_signals_on_publish() {
        let svc = service();
        let mut rx = svc.take_update_receiver().unwrap();
        svc.publish_for_tests(sample_telemetry()).await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn register_image_reflects_cache() {
        let svc = service();
        svc.publish_for_tests(sample_telemetry()).await;
        let image = svc.register_image().await;
        assert_eq!(&image[0..3], &[8500, 120, 753]);
    }
}
