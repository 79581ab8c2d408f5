use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::error::{EmsError, Result};

/// Client for one remote-register device endpoint.
///
/// The underlying tokio-modbus context is kept behind a mutex so that there
/// is exactly one in-flight request per device at any time; callers never
/// see interleaved frames. No retries happen here - the owning service's
/// reconnect loop is the retry policy.
pub struct DeviceClient {
    addr: SocketAddr,
    unit_id: u8,
    dial_timeout: Duration,
    request_timeout: Duration,
    ctx: Mutex<Option<Context>>,
    connected: AtomicBool,
}

impl DeviceClient {
    pub fn new(
        addr: SocketAddr,
        unit_id: u8,
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            unit_id,
            dial_timeout,
            request_timeout,
            ctx: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Establish the TCP connection. Idempotent: an already-connected
    /// client returns immediately. Bounded by the dial timeout.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.ctx.lock().await;
        if guard.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut ctx = match timeout(self.dial_timeout, tcp::connect(self.addr)).await {
            Err(_) => return Err(EmsError::Timeout),
            Ok(Err(e)) => return Err(EmsError::Io(e)),
            Ok(Ok(ctx)) => ctx,
        };
        ctx.set_slave(Slave(self.unit_id));
        *guard = Some(ctx);
        self.connected.store(true, Ordering::SeqCst);
        debug!(addr = %self.addr, unit = self.unit_id, "device connected");
        Ok(())
    }

    /// Drop the connection. Closing the socket is enough; the remote side
    /// sees a plain TCP close.
    pub async fn disconnect(&self) {
        let mut guard = self.ctx.lock().await;
        guard.take();
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Read `qty` holding registers starting at `addr`. Returns exactly
    /// `qty` big-endian words.
    pub async fn read_holding(&self, addr: u16, qty: u16) -> Result<Vec<u16>> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(EmsError::NotConnected)?;
        match timeout(self.request_timeout, ctx.read_holding_registers(addr, qty)).await {
            Err(_) => Err(EmsError::Timeout),
            Ok(Err(e)) => Err(self.classify(e)),
            Ok(Ok(words)) => Ok(words),
        }
    }

    /// Write a single holding register.
    pub async fn write_single(&self, addr: u16, value: u16) -> Result<()> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(EmsError::NotConnected)?;
        match timeout(self.request_timeout, ctx.write_single_register(addr, value)).await {
            Err(_) => Err(EmsError::Timeout),
            Ok(Err(e)) => Err(self.classify(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Map an I/O failure onto the EMS error kinds. Device exception
    /// responses keep the protocol code; transport failures mark the client
    /// disconnected so the owning service's reconnect loop takes over.
    fn classify(&self, e: std::io::Error) -> EmsError {
        if e.kind() == std::io::ErrorKind::TimedOut {
            return EmsError::Timeout;
        }
        if let Some(exc) = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ExceptionResponse>())
        {
            return EmsError::Protocol {
                code: exc.exception as u8,
            };
        }
        self.connected.store(false, Ordering::SeqCst);
        EmsError::Io(e)
    }
}
