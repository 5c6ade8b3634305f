//! Adaptive next-day demand forecasting and grid pre-charge control for a
//! battery-backed load, with a simulated register-polling device.

pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod ml;
pub mod modbus;
pub mod simulation;
pub mod telemetry;
