//! Mock Modbus-TCP field device for integration tests. Serves holding
//! register reads and records writes so tests can assert what the EMS put
//! on the wire.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

pub struct MockDevice {
    registers: RwLock<HashMap<u16, u16>>,
}

impl MockDevice {
    /// Bind on an ephemeral port, start serving, and return the handle and
    /// the address clients should dial.
    pub async fn spawn() -> (Arc<Self>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock device");
        let addr = listener.local_addr().expect("mock device addr");
        let device = Arc::new(Self {
            registers: RwLock::new(HashMap::new()),
        });

        let server = Arc::clone(&device);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let device = Arc::clone(&server);
                tokio::spawn(async move {
                    let _ = device.serve_connection(stream).await;
                });
            }
        });
        (device, addr)
    }

    pub async fn set_register(&self, address: u16, value: u16) {
        self.registers.write().await.insert(address, value);
    }

    pub async fn set_registers(&self, start: u16, values: &[u16]) {
        let mut registers = self.registers.write().await;
        for (i, &value) in values.iter().enumerate() {
            registers.insert(start + i as u16, value);
        }
    }

    pub async fn register(&self, address: u16) -> u16 {
        self.registers.read().await.get(&address).copied().unwrap_or(0)
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut header = [0u8; 7];
        loop {
            if stream.read_exact(&mut header).await.is_err() {
                return Ok(());
            }
            let transaction = u16::from_be_bytes([header[0], header[1]]);
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            let unit = header[6];
            if !(2..=256).contains(&length) {
                return Ok(());
            }
            let mut body = vec![0u8; length - 1];
            stream.read_exact(&mut body).await?;

            let function = body[0];
            let data = &body[1..];
            let pdu = match function {
                0x03 => self.read_holding(data).await,
                0x06 => self.write_single(data).await,
                0x10 => self.write_multiple(data).await,
                _ => vec![function | 0x80, 0x01],
            };

            let mut response = Vec::with_capacity(7 + pdu.len());
            response.extend_from_slice(&transaction.to_be_bytes());
            response.extend_from_slice(&0u16.to_be_bytes());
            response.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
            response.push(unit);
            response.extend_from_slice(&pdu);
            stream.write_all(&response).await?;
        }
    }

    async fn read_holding(&self, data: &[u8]) -> Vec<u8> {
        if data.len() < 4 {
            return vec![0x83, 0x03];
        }
        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity == 0 || quantity > 125 {
            return vec![0x83, 0x03];
        }
        let registers = self.registers.read().await;
        let mut pdu = vec![0x03, (quantity * 2) as u8];
        for i in 0..quantity {
            let value = registers.get(&(start + i)).copied().unwrap_or(0);
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        pdu
    }

    async fn write_single(&self, data: &[u8]) -> Vec<u8> {
        if data.len() < 4 {
            return vec![0x86, 0x03];
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);
        self.registers.write().await.insert(address, value);
        let mut pdu = vec![0x06];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        pdu
    }

    async fn write_multiple(&self, data: &[u8]) -> Vec<u8> {
        if data.len() < 5 {
            return vec![0x90, 0x03];
        }
        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        let byte_count = data[4] as usize;
        if byte_count != quantity as usize * 2 || data.len() < 5 + byte_count {
            return vec![0x90, 0x03];
        }
        let mut registers = self.registers.write().await;
        for i in 0..quantity {
            let at = 5 + (i as usize) * 2;
            let value = u16::from_be_bytes([data[at], data[at + 1]]);
            registers.insert(start + i, value);
        }
        let mut pdu = vec![0x10];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&quantity.to_be_bytes());
        pdu
    }
}
