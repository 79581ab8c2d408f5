//! Power conversion system unit: telemetry model, register layout,
//! polling service, and the start/stop / power command surface.

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
use crate::modbus::words::{
    decode_i16, decode_u16, encode_i16, encode_u16, fits_i16, join_u32, split_u32,
};
use crate::persistence::{PersistenceHandle, SampleBatch};

use super::{reconnect, run_heartbeat, sleep_until_boundary, UpdateSignal};

// Device register map. Telemetry mirrors the 68-word image republished by
// the external register server; commands live in their own block.
const REG_STATUS_BASE: u16 = 0; // status, equipment, environment
const REG_DC_BASE: u16 = 3; // four DC sources x (power, current, voltage)
const REG_GRID_BASE: u16 = 15; // frequency + MV + LV sides
const REG_COUNTER_BASE: u16 = 35; // energy counters
const REG_FAULT_BASE: u16 = 80;
const REG_WARN_BASE: u16 = 84;
const REG_HEARTBEAT: u16 = 99;
const REG_START_STOP: u16 = 100;
const REG_ACTIVE_POWER: u16 = 101;
const REG_REACTIVE_POWER: u16 = 102;
const REG_RESET: u16 = 103;

const STATUS_WORDS: u16 = 3;
const DC_WORDS: u16 = 12;
const GRID_WORDS: u16 = 20;
const COUNTER_WORDS: u16 = 4;
const FAULT_WORDS: u16 = 2;
const WARN_WORDS: u16 = 1;

pub const PCS_IMAGE_LEN: u16 = 68;

/// Device-facing power command scaling: kW x 100. The external register
/// server uses kW x 10; the two encodings never mix.
const POWER_CMD_SCALE: f64 = 100.0;
/// Engineering bound on any power command through this service.
const POWER_LIMIT_KW: f64 = 1500.0;

// Equipment bitfield positions in word 1.
const EQUIP_MAIN_BREAKER: u16 = 1 << 0;
const EQUIP_DC_SWITCH: u16 = 1 << 1;
const EQUIP_AC_SWITCH: u16 = 1 << 2;
const EQUIP_FANS: u16 = 1 << 3;

/// PCS lifecycle status word (0..=17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "PascalCase")]
pub enum PcsStatus {
    PowerUp,
    Init,
    Off,
    Standby,
    Precharge,
    Ready,
    On,
    Stopping,
    Stopped,
    GridForming,
    GridFollowing,
    Derating,
    Islanded,
    Maintenance,
    Updating,
    Warning,
    Alarm,
    Fault,
    Unknown,
}

impl PcsStatus {
    pub fn from_register(word: u16) -> Self {
        match word {
            0 => Self::PowerUp,
            1 => Self::Init,
            2 => Self::Off,
            3 => Self::Standby,
            4 => Self::Precharge,
            5 => Self::Ready,
            6 => Self::On,
            7 => Self::Stopping,
            8 => Self::Stopped,
            9 => Self::GridForming,
            10 => Self::GridFollowing,
            11 => Self::Derating,
            12 => Self::Islanded,
            13 => Self::Maintenance,
            14 => Self::Updating,
            15 => Self::Warning,
            16 => Self::Alarm,
            17 => Self::Fault,
            _ => Self::Unknown,
        }
    }

    pub fn to_register(self) -> u16 {
        match self {
            Self::PowerUp => 0,
            Self::Init => 1,
            Self::Off => 2,
            Self::Standby => 3,
            Self::Precharge => 4,
            Self::Ready => 5,
            Self::On => 6,
            Self::Stopping => 7,
            Self::Stopped => 8,
            Self::GridForming => 9,
            Self::GridFollowing => 10,
            Self::Derating => 11,
            Self::Islanded => 12,
            Self::Maintenance => 13,
            Self::Updating => 14,
            Self::Warning => 15,
            Self::Alarm => 16,
            Self::Fault => 17,
            Self::Unknown => 18,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DcSource {
    pub power_kw: f64,
    pub current_a: f64,
    pub voltage_v: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GridSide {
    pub voltage_ab_v: f64,
    pub voltage_bc_v: f64,
    pub voltage_ca_v: f64,
    pub current_a_a: f64,
    pub current_b_a: f64,
    pub current_c_a: f64,
    pub active_power_kw: f64,
    pub reactive_power_kvar: f64,
    pub cos_phi: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PcsTelemetry {
    pub timestamp: DateTime<Utc>,
    pub status: PcsStatus,
    pub main_breaker_closed: bool,
    pub dc_switch_closed: bool,
    pub ac_switch_closed: bool,
    pub fans_running: bool,
    pub environment_temp_c: f64,
    pub dc_sources: [DcSource; 4],
    /// Grid frequency at 0.0001 Hz resolution.
    pub grid_frequency_hz: f64,
    pub mv: GridSide,
    pub lv: GridSide,
    pub energy_charged_kwh: f64,
    pub energy_discharged_kwh: f64,
}

impl Default for PcsTelemetry {
    fn default() -> Self {
        Self {
            timestamp: DateTime::UNIX_EPOCH,
            status: PcsStatus::Unknown,
            main_breaker_closed: false,
            dc_switch_closed: false,
            ac_switch_closed: false,
            fans_running: false,
            environment_temp_c: 0.0,
            dc_sources: [DcSource::default(); 4],
            grid_frequency_hz: 0.0,
            mv: GridSide::default(),
            lv: GridSide::default(),
            energy_charged_kwh: 0.0,
            energy_discharged_kwh: 0.0,
        }
    }
}

/// Last successfully written commands. `active_power_cmd_kw` only advances
/// when the register write succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct PcsCommandState {
    pub start_stop: bool,
    pub active_power_cmd_kw: f64,
    pub reactive_power_cmd_kvar: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for PcsCommandState {
    fn default() -> Self {
        Self {
            start_stop: false,
            active_power_cmd_kw: 0.0,
            reactive_power_cmd_kvar: 0.0,
            last_updated: DateTime::UNIX_EPOCH,
        }
    }
}

// Phase voltages are rendered at 1 V resolution: the MV side sits around
// 20 kV and would overflow a x10 word.
fn render_grid_side(words: &mut [u16], side: &GridSide) {
    words[0] = encode_u16(side.voltage_ab_v, 1.0);
    words[1] = encode_u16(side.voltage_bc_v, 1.0);
    words[2] = encode_u16(side.voltage_ca_v, 1.0);
    words[3] = encode_u16(side.current_a_a, 10.0);
    words[4] = encode_u16(side.current_b_a, 10.0);
    words[5] = encode_u16(side.current_c_a, 10.0);
    words[6] = encode_i16(side.active_power_kw, 1.0);
    words[7] = encode_i16(side.reactive_power_kvar, 1.0);
    words[8] = encode_i16(side.cos_phi, 1000.0);
}

fn parse_grid_side(words: &[u16]) -> GridSide {
    GridSide {
        voltage_ab_v: decode_u16(words[0], 1.0),
        voltage_bc_v: decode_u16(words[1], 1.0),
        voltage_ca_v: decode_u16(words[2], 1.0),
        current_a_a: decode_u16(words[3], 10.0),
        current_b_a: decode_u16(words[4], 10.0),
        current_c_a: decode_u16(words[5], 10.0),
        active_power_kw: decode_i16(words[6], 1.0),
        reactive_power_kvar: decode_i16(words[7], 1.0),
        cos_phi: decode_i16(words[8], 1000.0),
    }
}

/// Decode the 68-word telemetry image.
pub fn parse_pcs_registers(words: &[u16], timestamp: DateTime<Utc>) -> PcsTelemetry {
    let equipment = words[1];
    let mut dc_sources = [DcSource::default(); 4];
    for (i, source) in dc_sources.iter_mut().enumerate() {
        let base = 3 + i * 3;
        *source = DcSource {
            power_kw: decode_i16(words[base], 10.0),
            current_a: decode_i16(words[base + 1], 10.0),
            voltage_v: decode_u16(words[base + 2], 10.0),
        };
    }
    PcsTelemetry {
        timestamp,
        status: PcsStatus::from_register(words[0]),
        main_breaker_closed: equipment & EQUIP_MAIN_BREAKER != 0,
        dc_switch_closed: equipment & EQUIP_DC_SWITCH != 0,
        ac_switch_closed: equipment & EQUIP_AC_SWITCH != 0,
        fans_running: equipment & EQUIP_FANS != 0,
        environment_temp_c: decode_i16(words[2], 10.0),
        dc_sources,
        grid_frequency_hz: join_u32(words[15], words[16]) as f64 / 10000.0,
        mv: parse_grid_side(&words[17..26]),
        lv: parse_grid_side(&words[26..35]),
        energy_charged_kwh: join_u32(words[35], words[36]) as f64,
        energy_discharged_kwh: join_u32(words[37], words[38]) as f64,
    }
}

/// Render the 68-word telemetry image; words 39..=67 are reserved.
pub fn render_pcs_registers(t: &PcsTelemetry) -> [u16; PCS_IMAGE_LEN as usize] {
    let mut words = [0u16; PCS_IMAGE_LEN as usize];
    words[0] = t.status.to_register();
    let mut equipment = 0u16;
    if t.main_breaker_closed {
        equipment |= EQUIP_MAIN_BREAKER;
    }
    if t.dc_switch_closed {
        equipment |= EQUIP_DC_SWITCH;
    }
    if t.ac_switch_closed {
        equipment |= EQUIP_AC_SWITCH;
    }
    if t.fans_running {
        equipment |= EQUIP_FANS;
    }
    words[1] = equipment;
    words[2] = encode_i16(t.environment_temp_c, 10.0);
    for (i, source) in t.dc_sources.iter().enumerate() {
        let base = 3 + i * 3;
        words[base] = encode_i16(source.power_kw, 10.0);
        words[base + 1] = encode_i16(source.current_a, 10.0);
        words[base + 2] = encode_u16(source.voltage_v, 10.0);
    }
    let [hi, lo] = split_u32((t.grid_frequency_hz * 10000.0).round().max(0.0) as u32);
    words[15] = hi;
    words[16] = lo;
    render_grid_side(&mut words[17..26], &t.mv);
    render_grid_side(&mut words[26..35], &t.lv);
    let [hi, lo] = split_u32(t.energy_charged_kwh.round().max(0.0) as u32);
    words[35] = hi;
    words[36] = lo;
    let [hi, lo] = split_u32(t.energy_discharged_kwh.round().max(0.0) as u32);
    words[37] = hi;
    words[38] = lo;
    words
}

#[derive(Default)]
struct PcsCache {
    telemetry: PcsTelemetry,
    command: PcsCommandState,
}

/// One power conversion unit: owns the device client, the parsed telemetry
/// cache, the command state and the poll/heartbeat/persist tasks.
pub struct PcsService {
    cfg: DeviceEndpoint,
    client: Arc<DeviceClient>,
    cache: RwLock<PcsCache>,
    update: UpdateSignal,
    alarms: Arc<AlarmManager>,
    persistence: PersistenceHandle,
    cancel: CancellationToken,
    started: AtomicBool,
    source_fault: String,
    source_warning: String,
}

impl PcsService {
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
        let source_fault = format!("pcs{}_fault", cfg.id);
        let source_warning = format!("pcs{}_warning", cfg.id);
        Ok(Arc::new(Self {
            cfg,
            client,
            cache: RwLock::new(PcsCache::default()),
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

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EmsError::ConfigInvalid(format!(
                "pcs service {} already started",
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
        info!(unit = self.cfg.id, "pcs service started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.client.disconnect().await;
        info!(unit = self.cfg.id, "pcs service stopped");
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
                warn!(unit = self.cfg.id, error = %e, "pcs poll cycle failed");
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let (status, dc, grid, counters, faults, warnings) = tokio::try_join!(
            self.client.read_holding(REG_STATUS_BASE, STATUS_WORDS),
            self.client.read_holding(REG_DC_BASE, DC_WORDS),
            self.client.read_holding(REG_GRID_BASE, GRID_WORDS),
            self.client.read_holding(REG_COUNTER_BASE, COUNTER_WORDS),
            self.client.read_holding(REG_FAULT_BASE, FAULT_WORDS),
            self.client.read_holding(REG_WARN_BASE, WARN_WORDS),
        )?;

        // Reassemble the regions into the contiguous image the parser and
        // the external server share.
        let mut image = [0u16; PCS_IMAGE_LEN as usize];
        image[..STATUS_WORDS as usize].copy_from_slice(&status);
        image[REG_DC_BASE as usize..(REG_DC_BASE + DC_WORDS) as usize].copy_from_slice(&dc);
        image[REG_GRID_BASE as usize..(REG_GRID_BASE + GRID_WORDS) as usize]
            .copy_from_slice(&grid);
        image[REG_COUNTER_BASE as usize..(REG_COUNTER_BASE + COUNTER_WORDS) as usize]
            .copy_from_slice(&counters);

        let timestamp = Utc::now();
        let parsed = parse_pcs_registers(&image, timestamp);

        self.alarms
            .process(&self.source_fault, &codes::PCS_FAULTS, &faults);
        self.alarms
            .process(&self.source_warning, &codes::PCS_WARNINGS, &warnings);

        {
            let mut cache = self.cache.write().await;
            cache.telemetry = parsed;
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
                source: format!("pcs{}", self.cfg.id),
                timestamp: snapshot.timestamp,
                points: vec![
                    ("status", snapshot.status.to_register() as f64),
                    ("environment_temp_c", snapshot.environment_temp_c),
                    ("grid_frequency_hz", snapshot.grid_frequency_hz),
                    ("mv_active_power_kw", snapshot.mv.active_power_kw),
                    ("mv_reactive_power_kvar", snapshot.mv.reactive_power_kvar),
                    ("lv_active_power_kw", snapshot.lv.active_power_kw),
                    ("energy_charged_kwh", snapshot.energy_charged_kwh),
                    ("energy_discharged_kwh", snapshot.energy_discharged_kwh),
                ],
            });
        }
    }

    pub async fn telemetry(&self) -> PcsTelemetry {
        self.cache.read().await.telemetry.clone()
    }

    pub async fn command_state(&self) -> PcsCommandState {
        self.cache.read().await.command.clone()
    }

    /// Snapshot the cache and render the external 68-word image.
    pub async fn register_image(&self) -> [u16; PCS_IMAGE_LEN as usize] {
        let cache = self.cache.read().await;
        render_pcs_registers(&cache.telemetry)
    }

    pub async fn start_stop(&self, start: bool) -> Result<()> {
        if !self.client.is_connected() {
            return Err(EmsError::NotConnected);
        }
        self.client
            .write_single(REG_START_STOP, if start { 1 } else { 0 })
            .await?;
        let mut cache = self.cache.write().await;
        cache.command.start_stop = start;
        cache.command.last_updated = Utc::now();
        info!(unit = self.cfg.id, start, "pcs start/stop commanded");
        Ok(())
    }

    /// Command active power in kW (positive = discharge to grid). Rejected
    /// without a write when out of the engineering range or when the
    /// device-scaled value would wrap the signed register.
    pub async fn set_active_power(&self, kw: f64) -> Result<()> {
        if !self.client.is_connected() {
            return Err(EmsError::NotConnected);
        }
        if !kw.is_finite() || kw.abs() > POWER_LIMIT_KW {
            return Err(EmsError::out_of_range(
                "active power",
                kw,
                -POWER_LIMIT_KW,
                POWER_LIMIT_KW,
            ));
        }
        // A wrapped i16 write reverses polarity: 500 kW x100 becomes a
        // discharge command. Reject instead of clamping silently.
        if !fits_i16(kw, POWER_CMD_SCALE) {
            return Err(EmsError::out_of_range(
                "scaled active power",
                kw,
                i16::MIN as f64 / POWER_CMD_SCALE,
                i16::MAX as f64 / POWER_CMD_SCALE,
            ));
        }
        self.client
            .write_single(REG_ACTIVE_POWER, encode_i16(kw, POWER_CMD_SCALE))
            .await?;
        let mut cache = self.cache.write().await;
        cache.command.active_power_cmd_kw = kw;
        cache.command.last_updated = Utc::now();
        info!(unit = self.cfg.id, power_kw = kw, "pcs active power commanded");
        Ok(())
    }

    /// Command reactive power in kVAr. Same bounds handling as active power.
    pub async fn set_reactive_power(&self, kvar: f64) -> Result<()> {
        if !self.client.is_connected() {
            return Err(EmsError::NotConnected);
        }
        if !kvar.is_finite() || kvar.abs() > POWER_LIMIT_KW {
            return Err(EmsError::out_of_range(
                "reactive power",
                kvar,
                -POWER_LIMIT_KW,
                POWER_LIMIT_KW,
            ));
        }
        if !fits_i16(kvar, POWER_CMD_SCALE) {
            return Err(EmsError::out_of_range(
                "scaled reactive power",
                kvar,
                i16::MIN as f64 / POWER_CMD_SCALE,
                i16::MAX as f64 / POWER_CMD_SCALE,
            ));
        }
        self.client
            .write_single(REG_REACTIVE_POWER, encode_i16(kvar, POWER_CMD_SCALE))
            .await?;
        let mut cache = self.cache.write().await;
        cache.command.reactive_power_cmd_kvar = kvar;
        cache.command.last_updated = Utc::now();
        info!(unit = self.cfg.id, reactive_kvar = kvar, "pcs reactive power commanded");
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        if !self.client.is_connected() {
            return Err(EmsError::NotConnected);
        }
        self.client.write_single(REG_RESET, 1).await?;
        let mut cache = self.cache.write().await;
        cache.command.last_updated = Utc::now();
        info!(unit = self.cfg.id, "pcs reset commanded");
        Ok(())
    }

    /// Test seam: install a parsed snapshot as if a poll cycle produced it.
    #[cfg(test)]
    pub(crate) async fn publish_for_tests(&self, telemetry: PcsTelemetry) {
        let mut cache = self.cache.write().await;
        cache.telemetry = telemetry;
        drop(cache);
        self.update.notify();
    }
}
