//! # Device Simulation
//!
//! Stands in for the physical energy-storage device: replays an hourly
//! consumption trace against a simple battery model and exposes its state
//! through the shared register block.

pub mod device;

pub use device::{DeviceConfig, DeviceSimulator, SimulatorStep};
