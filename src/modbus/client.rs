use anyhow::{anyhow, Context as AnyhowContext, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use super::frame::{address, RegisterFrame, BLOCK_START, REGISTER_COUNT};
use super::RegisterDevice;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy)]
enum Request {
    ReadHolding { start: u16, count: u16 },
    WriteSingle { addr: u16, value: u16 },
}

enum Reply {
    Words(Vec<u16>),
    Written,
}

/// Modbus TCP client for the device register block
pub struct ModbusClient {
    context: Arc<Mutex<tokio_modbus::client::Context>>,
    unit_id: u8,
    socket_addr: SocketAddr,
    timeout_duration: Duration,
}

impl ModbusClient {
    /// Connect to a Modbus TCP device with default timeout
    pub async fn connect(addr: &str, unit_id: u8) -> Result<Self> {
        Self::connect_with_timeout(addr, unit_id, DEFAULT_TIMEOUT).await
    }

    /// Connect to a Modbus TCP device with custom timeout
    pub async fn connect_with_timeout(
        addr: &str,
        unit_id: u8,
        timeout_duration: Duration,
    ) -> Result<Self> {
        let socket_addr = tokio::net::lookup_host(addr)
            .await
            .with_context(|| format!("Invalid device address '{addr}'"))?
            .next()
            .ok_or_else(|| anyhow!("Device address '{addr}' did not resolve"))?;

        debug!("Connecting to Modbus device at {} (unit {})", socket_addr, unit_id);

        let ctx = timeout(timeout_duration, tcp::connect(socket_addr))
            .await
            .context("Connection timeout")?
            .context("Failed to connect")?;

        Ok(Self {
            context: Arc::new(Mutex::new(ctx)),
            unit_id,
            socket_addr,
            timeout_duration,
        })
    }

    /// Read holding registers with automatic retry
    pub async fn read_holding_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
        match self.execute(Request::ReadHolding { start, count }).await {
            Ok(Reply::Words(words)) => Ok(words),
            Ok(Reply::Written) => Err(anyhow!("Unexpected write reply to a read")),
            Err(e) => Err(e.context(format!("Failed to read holding registers at {start}"))),
        }
    }

    /// Write a single register
    pub async fn write_single_register(&self, addr: u16, value: u16) -> Result<()> {
        self.execute(Request::WriteSingle { addr, value })
            .await
            .map(|_| ())
            .with_context(|| format!("Failed to write register at {addr}"))
    }

    /// Reconnect to the device
    pub async fn reconnect(&self) -> Result<()> {
        warn!("Reconnecting to Modbus device at {}", self.socket_addr);
        let new_ctx = timeout(self.timeout_duration, tcp::connect(self.socket_addr))
            .await
            .context("Reconnection timeout")?
            .context("Failed to reconnect")?;

        let mut ctx = self.context.lock().await;
        *ctx = new_ctx;
        Ok(())
    }

    /// Close the connection
    pub async fn disconnect(&self) -> Result<()> {
        let mut ctx = self.context.lock().await;
        ctx.disconnect().await.context("Failed to disconnect")?;
        debug!("Disconnected from Modbus device at {}", self.socket_addr);
        Ok(())
    }

    /// Execute a request with bounded retries; reconnects after the last failure
    async fn execute(&self, request: Request) -> Result<Reply> {
        let mut last_error = anyhow!("no attempt made");

        for attempt in 1..=MAX_ATTEMPTS {
            let mut ctx = self.context.lock().await;
            ctx.set_slave(Slave(self.unit_id));

            let call = async {
                match request {
                    Request::ReadHolding { start, count } => ctx
                        .read_holding_registers(start, count)
                        .await
                        .map(Reply::Words),
                    Request::WriteSingle { addr, value } => ctx
                        .write_single_register(addr, value)
                        .await
                        .map(|_| Reply::Written),
                }
            };

            match timeout(self.timeout_duration, call).await {
                Ok(Ok(reply)) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(reply);
                }
                Ok(Err(e)) => {
                    warn!(?request, "Modbus operation failed (attempt {}): {}", attempt, e);
                    last_error = anyhow!(e);
                }
                Err(_) => {
                    warn!(?request, "Modbus operation timeout (attempt {})", attempt);
                    last_error = anyhow!("Operation timeout after {:?}", self.timeout_duration);
                }
            }

            drop(ctx); // Release lock before sleeping
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
        }

        if let Err(e) = self.reconnect().await {
            warn!(error = %e, "reconnect failed");
        }
        Err(last_error.context(format!("Operation failed after {MAX_ATTEMPTS} attempts")))
    }
}

#[async_trait]
impl RegisterDevice for ModbusClient {
    async fn read_frame(&self) -> Result<RegisterFrame> {
        let words = self.read_holding_registers(BLOCK_START, REGISTER_COUNT).await?;
        Ok(RegisterFrame::decode(&words)?)
    }

    async fn write_grid_connected(&self, connected: bool) -> Result<()> {
        self.write_single_register(address::GRID_CONNECTED, u16::from(connected))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.disconnect().await
    }
}
