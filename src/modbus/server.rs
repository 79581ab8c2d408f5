//! External register server: a Modbus-TCP surface mirroring the device
//! command model for remote supervisors.
//!
//! Address plan (flat, partitioned by device class and unit number):
//! - battery telemetry: base 1000, stride 100 per unit, 41 words
//! - PCS telemetry: base 4000, stride 300 per unit, 68 words
//! - commands: base 1000, stride 100 per unit; offset 0 start/stop,
//!   offset 1 active power (i16, kW x 10), offset 2 reactive power
//!   (i16, kVAr x 10). Reads serve telemetry; writes serve commands.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::devices::bms::BATTERY_IMAGE_LEN;
use crate::devices::manager::{BmsManager, PcsManager};
use crate::devices::pcs::PCS_IMAGE_LEN;
use crate::error::EmsError;

pub const BMS_BASE: u16 = 1000;
pub const BMS_STRIDE: u16 = 100;
pub const PCS_BASE: u16 = 4000;
pub const PCS_STRIDE: u16 = 300;

pub const CMD_START_STOP: u16 = 0;
pub const CMD_ACTIVE_POWER: u16 = 1;
pub const CMD_REACTIVE_POWER: u16 = 2;

/// Server-facing power scaling: kW x 10. Distinct from the device-facing
/// kW x 100 encoding used inside the PCS service.
pub const CMD_POWER_SCALE: f64 = 10.0;

const MAX_READ_QUANTITY: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

struct RegisterHandler {
    bms: Arc<BmsManager>,
    pcs: Arc<PcsManager>,
}

impl RegisterHandler {
    /// Resolve a read span onto one unit's telemetry image and render it.
    /// Spans crossing a unit boundary or touching reserved space return
    /// `IllegalDataAddress`.
    async fn read_registers(&self, addr: u16, qty: u16) -> Result<Vec<u16>, ExceptionCode> {
        if qty == 0 || qty > MAX_READ_QUANTITY {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if (BMS_BASE..PCS_BASE).contains(&addr) {
            let unit = (addr - BMS_BASE) / BMS_STRIDE + 1;
            let offset = (addr - BMS_BASE) % BMS_STRIDE;
            let service = self
                .bms
                .get(unit)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            if offset + qty > BATTERY_IMAGE_LEN {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let image = service.register_image().await;
            Ok(image[offset as usize..(offset + qty) as usize].to_vec())
        } else if addr >= PCS_BASE {
            let unit = (addr - PCS_BASE) / PCS_STRIDE + 1;
            let offset = (addr - PCS_BASE) % PCS_STRIDE;
            let service = self
                .pcs
                .get(unit)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            if offset + qty > PCS_IMAGE_LEN {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let image = service.register_image().await;
            Ok(image[offset as usize..(offset + qty) as usize].to_vec())
        } else {
            Err(ExceptionCode::IllegalDataAddress)
        }
    }

    /// Command-region write. The service Arc is resolved first and no lock
    /// is held across the device round trip, so reads stay unblocked.
    async fn write_register(&self, addr: u16, value: u16) -> Result<(), ExceptionCode> {
        if !(BMS_BASE..PCS_BASE).contains(&addr) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let unit = (addr - BMS_BASE) / BMS_STRIDE + 1;
        let offset = (addr - BMS_BASE) % BMS_STRIDE;
        let service = self
            .pcs
            .get(unit)
            .ok_or(ExceptionCode::IllegalDataAddress)?;

        let result = match offset {
            CMD_START_STOP => match value {
                0 => service.start_stop(false).await,
                1 => service.start_stop(true).await,
                _ => return Err(ExceptionCode::IllegalDataValue),
            },
            CMD_ACTIVE_POWER => {
                let kw = value as i16 as f64 / CMD_POWER_SCALE;
                service.set_active_power(kw).await
            }
            CMD_REACTIVE_POWER => {
                let kvar = value as i16 as f64 / CMD_POWER_SCALE;
                service.set_reactive_power(kvar).await
            }
            _ => return Err(ExceptionCode::IllegalDataAddress),
        };

        result.map_err(|e| match e {
            EmsError::OutOfRange { .. } => ExceptionCode::IllegalDataValue,
            _ => {
                warn!(unit, offset, error = %e, "command write failed");
                ExceptionCode::ServerDeviceFailure
            }
        })
    }

    /// Process one request PDU (function code + data) into a response PDU.
    async fn process(&self, function: u8, data: &[u8]) -> Vec<u8> {
        match function {
            0x03 => {
                if data.len() < 4 {
                    return exception_pdu(function, ExceptionCode::IllegalDataValue);
                }
                let addr = u16::from_be_bytes([data[0], data[1]]);
                let qty = u16::from_be_bytes([data[2], data[3]]);
                match self.read_registers(addr, qty).await {
                    Ok(words) => {
                        let mut pdu = Vec::with_capacity(2 + words.len() * 2);
                        pdu.push(function);
                        pdu.push((words.len() * 2) as u8);
                        for word in words {
                            pdu.extend_from_slice(&word.to_be_bytes());
                        }
                        pdu
                    }
                    Err(code) => exception_pdu(function, code),
                }
            }
            0x06 => {
                if data.len() < 4 {
                    return exception_pdu(function, ExceptionCode::IllegalDataValue);
                }
                let addr = u16::from_be_bytes([data[0], data[1]]);
                let value = u16::from_be_bytes([data[2], data[3]]);
                match self.write_register(addr, value).await {
                    Ok(()) => {
                        let mut pdu = Vec::with_capacity(5);
                        pdu.push(function);
                        pdu.extend_from_slice(&addr.to_be_bytes());
                        pdu.extend_from_slice(&value.to_be_bytes());
                        pdu
                    }
                    Err(code) => exception_pdu(function, code),
                }
            }
            0x10 => {
                if data.len() < 5 {
                    return exception_pdu(function, ExceptionCode::IllegalDataValue);
                }
                let addr = u16::from_be_bytes([data[0], data[1]]);
                let qty = u16::from_be_bytes([data[2], data[3]]);
                let byte_count = data[4] as usize;
                if qty == 0 || qty > MAX_READ_QUANTITY || byte_count != qty as usize * 2 {
                    return exception_pdu(function, ExceptionCode::IllegalDataValue);
                }
                if data.len() < 5 + byte_count {
                    return exception_pdu(function, ExceptionCode::IllegalDataValue);
                }
                for i in 0..qty {
                    let at = 5 + (i as usize) * 2;
                    let value = u16::from_be_bytes([data[at], data[at + 1]]);
                    if let Err(code) = self.write_register(addr + i, value).await {
                        return exception_pdu(function, code);
                    }
                }
                let mut pdu = Vec::with_capacity(5);
                pdu.push(function);
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(&qty.to_be_bytes());
                pdu
            }
            _ => exception_pdu(function, ExceptionCode::IllegalFunction),
        }
    }
}

fn exception_pdu(function: u8, code: ExceptionCode) -> Vec<u8> {
    vec![function | 0x80, code as u8]
}

/// Modbus-TCP server fronting the device managers.
pub struct RegisterServer {
    addr: SocketAddr,
    handler: Arc<RegisterHandler>,
}

impl RegisterServer {
    pub fn new(addr: SocketAddr, bms: Arc<BmsManager>, pcs: Arc<PcsManager>) -> Self {
        Self {
            addr,
            handler: Arc::new(RegisterHandler { bms, pcs }),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(cancel).await {
                error!(error = %e, "register server terminated");
            }
        })
    }

    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "register server listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            debug!(%peer, "register client connected");
            let handler = Arc::clone(&self.handler);
            let conn_cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(handler, stream, conn_cancel).await {
                    debug!(%peer, error = %e, "register connection closed");
                }
            });
        }
        info!("register server stopped");
        Ok(())
    }
}

/// One MBAP-framed connection: 7-byte header (transaction, protocol,
/// length, unit), then `length - 1` bytes of PDU.
async fn handle_connection(
    handler: Arc<RegisterHandler>,
    mut stream: TcpStream,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut header = [0u8; 7];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read_exact(&mut header) => {
                if read.is_err() {
                    return Ok(()); // peer closed
                }
            }
        }

        let transaction = u16::from_be_bytes([header[0], header[1]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit = header[6];
        if length < 2 || length > 256 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad MBAP length",
            ));
        }

        let mut body = vec![0u8; length - 1];
        stream.read_exact(&mut body).await?;
        let function = body[0];
        let pdu = handler.process(function, &body[1..]).await;

        let mut response = Vec::with_capacity(7 + pdu.len());
        response.extend_from_slice(&transaction.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
        response.push(unit);
        response.extend_from_slice(&pdu);
        stream.write_all(&response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::AlarmManager;
    use crate::config::DeviceEndpoint;
    use crate::devices::bms::{BatteryStatus, BatteryTelemetry, BmsService};
    use crate::devices::pcs::PcsService;
    use crate::persistence::{spawn_persistence_worker, LoggingSink};
    use chrono::Utc;

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

    async fn handler_with_units(bms_units: u16, pcs_units: u16) -> RegisterHandler {
        let alarms = Arc::new(AlarmManager::new());
        let bms_services: Vec<Arc<BmsService>> = (1..=bms_units)
            .map(|id| BmsService::new(endpoint(id), Arc::clone(&alarms), persistence()).unwrap())
            .collect();
        let pcs_services: Vec<Arc<PcsService>> = (1..=pcs_units)
            .map(|id| PcsService::new(endpoint(id), Arc::clone(&alarms), persistence()).unwrap())
            .collect();
        RegisterHandler {
            bms: Arc::new(BmsManager::new(bms_services)),
            pcs: Arc::new(PcsManager::new(pcs_services)),
        }
    }

    fn seeded_telemetry() -> BatteryTelemetry {
        BatteryTelemetry {
            timestamp: Utc::now(),
            voltage_v: 850.0,
            current_a: 120.0,
            soc_percent: 75.3,
            system_status: BatteryStatus::Idle,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn battery_read_renders_scaled_words() {
        let handler = handler_with_units(2, 1).await;
        handler
            .bms
            .get(1)
            .unwrap()
            .publish_for_tests(seeded_telemetry())
            .await;

        let words = handler.read_registers(BMS_BASE, 3).await.unwrap();
        assert_eq!(words, vec![8500, 120, 753]);
    }

    #[tokio::test]
    async fn second_unit_lives_one_stride_up() {
        let handler = handler_with_units(2, 1).await;
        handler
            .bms
            .get(2)
            .unwrap()
            .publish_for_tests(seeded_telemetry())
            .await;

        let words = handler
            .read_registers(BMS_BASE + BMS_STRIDE, 3)
            .await
            .unwrap();
        assert_eq!(words, vec![8500, 120, 753]);
        // Unit 1 is still all zeros at the voltage word.
        let words = handler.read_registers(BMS_BASE, 1).await.unwrap();
        assert_eq!(words, vec![0]);
    }

    #[tokio::test]
    async fn unknown_unit_is_illegal_data_address() {
        let handler = handler_with_units(1, 1).await;
        assert_eq!(
            handler
                .read_registers(BMS_BASE + 5 * BMS_STRIDE, 1)
                .await
                .unwrap_err(),
            ExceptionCode::IllegalDataAddress
        );
        assert_eq!(
            handler
                .read_registers(PCS_BASE + 3 * PCS_STRIDE, 1)
                .await
                .unwrap_err(),
            ExceptionCode::IllegalDataAddress
        );
    }

    #[tokio::test]
    async fn read_past_payload_end_is_illegal_data_address() {
        let handler = handler_with_units(1, 1).await;
        assert_eq!(
            handler
                .read_registers(BMS_BASE + BATTERY_IMAGE_LEN - 1, 2)
                .await
                .unwrap_err(),
            ExceptionCode::IllegalDataAddress
        );
        assert!(handler
            .read_registers(BMS_BASE + BATTERY_IMAGE_LEN - 1, 1)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn quantity_bounds_are_enforced() {
        let handler = handler_with_units(1, 1).await;
        assert_eq!(
            handler.read_registers(BMS_BASE, 0).await.unwrap_err(),
            ExceptionCode::IllegalDataValue
        );
        assert_eq!(
            handler.read_registers(BMS_BASE, 126).await.unwrap_err(),
            ExceptionCode::IllegalDataValue
        );
    }

    #[tokio::test]
    async fn pcs_read_uses_its_own_base_and_stride() {
        let handler = handler_with_units(1, 2).await;
        let words = handler
            .read_registers(PCS_BASE + PCS_STRIDE, 4)
            .await
            .unwrap();
        assert_eq!(words.len(), 4);
    }

    #[tokio::test]
    async fn command_write_to_disconnected_pcs_is_server_device_failure() {
        let handler = handler_with_units(1, 1).await;
        assert_eq!(
            handler
                .write_register(BMS_BASE + CMD_ACTIVE_POWER, 1000)
                .await
                .unwrap_err(),
            ExceptionCode::ServerDeviceFailure
        );
    }

    #[tokio::test]
    async fn start_stop_write_accepts_only_zero_and_one() {
        let handler = handler_with_units(1, 1).await;
        assert_eq!(
            handler
                .write_register(BMS_BASE + CMD_START_STOP, 2)
                .await
                .unwrap_err(),
            ExceptionCode::IllegalDataValue
        );
    }

    #[tokio::test]
    async fn write_outside_command_offsets_is_illegal_data_address() {
        let handler = handler_with_units(1, 1).await;
        assert_eq!(
            handler.write_register(BMS_BASE + 10, 1).await.unwrap_err(),
            ExceptionCode::IllegalDataAddress
        );
        assert_eq!(
            handler.write_register(500, 1).await.unwrap_err(),
            ExceptionCode::IllegalDataAddress
        );
    }

    #[tokio::test]
    async fn read_request_pdu_round_trip() {
        let handler = handler_with_units(1, 1).await;
        handler
            .bms
            .get(1)
            .unwrap()
            .publish_for_tests(seeded_telemetry())
            .await;

        // fc 0x03, addr 1000, qty 2
        let mut data = Vec::new();
        data.extend_from_slice(&BMS_BASE.to_be_bytes());
        data.extend_from_slice(&2u16.to_be_bytes());
        let pdu = handler.process(0x03, &data).await;
        assert_eq!(pdu[0], 0x03);
        assert_eq!(pdu[1], 4); // byte count
        assert_eq!(u16::from_be_bytes([pdu[2], pdu[3]]), 8500);
        assert_eq!(u16::from_be_bytes([pdu[4], pdu[5]]), 120);
    }

    #[tokio::test]
    async fn unsupported_function_code_is_rejected() {
        let handler = handler_with_units(1, 1).await;
        let pdu = handler.process(0x05, &[0, 0, 0, 0]).await;
        assert_eq!(pdu[0], 0x05 | 0x80);
        assert_eq!(pdu[1], ExceptionCode::IllegalFunction as u8);
    }
}
