//! Device register protocol
//!
//! A 7-word holding-register block shared between the device simulator
//! (server side) and the controller (client side), exchanged over Modbus TCP.

pub mod client;
pub mod frame;
pub mod server;

pub use client::ModbusClient;
pub use frame::*;
pub use server::{RegisterBlock, RegisterServer};

use anyhow::Result;
use async_trait::async_trait;

/// Controller-side view of the device register block.
#[async_trait]
pub trait RegisterDevice: Send + Sync {
    /// Read and decode the whole block.
    async fn read_frame(&self) -> Result<RegisterFrame>;

    /// Write the grid-connection command register.
    async fn write_grid_connected(&self, connected: bool) -> Result<()>;

    /// Release the connection; called once when the control loop exits.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
