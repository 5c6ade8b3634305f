//! Modbus TCP server exposing the device register block.
//!
//! Only the functions the controller needs are served: read holding
//! registers (0x03), write single register (0x06) and write multiple
//! registers (0x10). Anything else gets an IllegalFunction exception.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{address, REGISTER_COUNT};

const MBAP_HEADER_LEN: usize = 7;
const MAX_PDU_LEN: usize = 253;
const MAX_READ_QUANTITY: u16 = 125;
/// Pause after a failed accept, e.g. when the process runs out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

/// Shared holding-register storage for the device block
#[derive(Debug, Clone)]
pub struct RegisterBlock {
    words: Arc<RwLock<[u16; REGISTER_COUNT as usize]>>,
}

impl RegisterBlock {
    pub fn new(initial: [u16; REGISTER_COUNT as usize]) -> Self {
        Self {
            words: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn snapshot(&self) -> [u16; REGISTER_COUNT as usize] {
        *self.words.read().await
    }

    pub async fn read(&self, start: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        let range = checked_range(start, count)?;
        Ok(self.words.read().await[range].to_vec())
    }

    pub async fn write(&self, start: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let count = u16::try_from(values.len()).map_err(|_| ExceptionCode::IllegalDataValue)?;
        let range = checked_range(start, count)?;
        let flag_offset = address::GRID_CONNECTED.checked_sub(start).map(usize::from);
        if let Some(flag) = flag_offset.and_then(|i| values.get(i)) {
            if *flag > 1 {
                return Err(ExceptionCode::IllegalDataValue);
            }
        }
        self.words.write().await[range].copy_from_slice(values);
        Ok(())
    }

    /// Write every register except the grid command, atomically.
    pub async fn publish_state(&self, soc_percent: u16, demand_kw: u16, hour: u16, date_words: [u16; 2]) {
        let mut words = self.words.write().await;
        words[address::SOC_PERCENT as usize] = soc_percent;
        words[address::DEMAND_KW as usize] = demand_kw;
        words[address::RESERVED as usize] = 0;
        words[address::SIMULATED_HOUR as usize] = hour;
        words[address::DATE_HIGH as usize] = date_words[0];
        words[address::DATE_LOW as usize] = date_words[1];
    }

    pub async fn grid_connected(&self) -> bool {
        self.words.read().await[address::GRID_CONNECTED as usize] == 1
    }
}

fn checked_range(start: u16, count: u16) -> Result<std::ops::Range<usize>, ExceptionCode> {
    if count == 0 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let end = usize::from(start) + usize::from(count);
    if end > usize::from(REGISTER_COUNT) {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(usize::from(start)..end)
}

/// Listening Modbus TCP endpoint
pub struct RegisterServer {
    listener: TcpListener,
}

impl RegisterServer {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(self, block: RegisterBlock, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(addr = %self.local_addr()?, "register server listening");
        loop {
            let (stream, peer) = match accept_next(self.listener.accept(), &shutdown).await {
                Accepted::Connection(stream, peer) => (stream, peer),
                Accepted::Retry => continue,
                Accepted::Shutdown => break,
            };
            debug!(%peer, "client connected");
            let block = block.clone();
            let token = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, block, token).await {
                    warn!(%peer, error = %e, "connection error");
                }
            });
        }
        info!("register server stopped");
        Ok(())
    }
}

#[derive(Debug)]
enum Accepted<S> {
    Connection(S, SocketAddr),
    Retry,
    Shutdown,
}

/// Wait for the next client. A failed accept is logged and followed by a
/// short backoff; it never ends the serve loop.
async fn accept_next<S>(
    accept: impl Future<Output = std::io::Result<(S, SocketAddr)>>,
    shutdown: &CancellationToken,
) -> Accepted<S> {
    let accepted = tokio::select! {
        _ = shutdown.cancelled() => return Accepted::Shutdown,
        accepted = accept => accepted,
    };
    match accepted {
        Ok((stream, peer)) => Accepted::Connection(stream, peer),
        Err(e) => {
            warn!(error = %e, "accept failed");
            tokio::select! {
                _ = shutdown.cancelled() => Accepted::Shutdown,
                _ = tokio::time::sleep(ACCEPT_BACKOFF) => Accepted::Retry,
            }
        }
    }
}

/// Serve one client until it disconnects or the token is cancelled
async fn handle_connection(
    mut stream: TcpStream,
    block: RegisterBlock,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = stream.read_exact(&mut header) => read,
        };
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let unit_id = header[6];
        if length < 2 || length - 1 > MAX_PDU_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid MBAP length {length}"),
            ));
        }

        let mut pdu = vec![0u8; length - 1];
        stream.read_exact(&mut pdu).await?;

        let reply = process_pdu(&block, &pdu).await;

        let mut response = Vec::with_capacity(MBAP_HEADER_LEN + reply.len());
        response.extend_from_slice(&transaction_id.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
        response.push(unit_id);
        response.extend_from_slice(&reply);
        stream.write_all(&response).await?;
    }
}

/// Process a request PDU and build the response PDU
async fn process_pdu(block: &RegisterBlock, pdu: &[u8]) -> Vec<u8> {
    let function = pdu[0];
    let data = &pdu[1..];
    let word = |i: usize| data.get(i..i + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));

    let result = match function {
        f if f == FunctionCode::ReadHoldingRegisters as u8 => match (word(0), word(2)) {
            (Some(start), Some(quantity)) if quantity <= MAX_READ_QUANTITY => {
                block.read(start, quantity).await.map(|values| {
                    let mut out = vec![function, (values.len() * 2) as u8];
                    for v in values {
                        out.extend_from_slice(&v.to_be_bytes());
                    }
                    out
                })
            }
            _ => Err(ExceptionCode::IllegalDataValue),
        },
        f if f == FunctionCode::WriteSingleRegister as u8 => match (word(0), word(2)) {
            (Some(addr), Some(value)) => block
                .write(addr, &[value])
                .await
                .map(|_| pdu[..5].to_vec()),
            _ => Err(ExceptionCode::IllegalDataValue),
        },
        f if f == FunctionCode::WriteMultipleRegisters as u8 => {
            match (word(0), word(2), data.get(4)) {
                (Some(start), Some(quantity), Some(&byte_count))
                    if usize::from(byte_count) == usize::from(quantity) * 2
                        && data.len() >= 5 + usize::from(byte_count) =>
                {
                    let values: Vec<u16> = (0..usize::from(quantity))
                        .filter_map(|i| word(5 + i * 2))
                        .collect();
                    block.write(start, &values).await.map(|_| pdu[..5].to_vec())
                }
                _ => Err(ExceptionCode::IllegalDataValue),
            }
        }
        _ => Err(ExceptionCode::IllegalFunction),
    };

    result.unwrap_or_else(|exception| vec![function | 0x80, exception as u8])
}
