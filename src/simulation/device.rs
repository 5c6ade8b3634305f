//! Battery-backed load replaying a consumption trace

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::Observation;
use crate::modbus::{date_to_yyyymmdd, encode_date_words, RegisterBlock, REGISTER_COUNT};

/// Device simulator configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Usable battery capacity (kWh)
    pub capacity_kwh: f64,
    /// Energy added per simulated hour while grid-connected (kWh)
    pub charge_rate_kwh: f64,
    pub initial_soc_percent: f64,
    pub initially_connected: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 240.0,
            charge_rate_kwh: 45.0,
            initial_soc_percent: 50.0,
            initially_connected: true,
        }
    }
}

/// State published after one simulated hour
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatorStep {
    pub timestamp: NaiveDateTime,
    pub grid_connected: bool,
    pub consumption_kwh: f64,
    pub soc_kwh: f64,
}

/// Owns the ground truth: the trace, the battery and the register block it publishes to.
pub struct DeviceSimulator {
    config: DeviceConfig,
    block: RegisterBlock,
    trace: Vec<Observation>,
    cursor: usize,
    soc_kwh: f64,
}

impl DeviceSimulator {
    pub fn new(config: DeviceConfig, trace: Vec<Observation>) -> Self {
        let soc_kwh = (config.initial_soc_percent / 100.0 * config.capacity_kwh)
            .clamp(0.0, config.capacity_kwh);
        let block = RegisterBlock::new(Self::initial_block(&config));
        Self {
            config,
            block,
            trace,
            cursor: 0,
            soc_kwh,
        }
    }

    /// `[SoC%, 0, 0, connected, 0, 0, 0]`; the date stays unset until the first step.
    pub fn initial_block(config: &DeviceConfig) -> [u16; REGISTER_COUNT as usize] {
        let mut words = [0; REGISTER_COUNT as usize];
        words[0] = soc_percent(
            config.initial_soc_percent / 100.0 * config.capacity_kwh,
            config.capacity_kwh,
        );
        words[3] = u16::from(config.initially_connected);
        words
    }

    /// Handle to the shared register block, for the Modbus server.
    pub fn block(&self) -> RegisterBlock {
        self.block.clone()
    }

    pub fn soc_kwh(&self) -> f64 {
        self.soc_kwh
    }

    pub fn remaining(&self) -> usize {
        self.trace.len() - self.cursor
    }

    /// Advance one simulated hour. Returns `None` once the trace is exhausted.
    pub async fn step(&mut self) -> Option<SimulatorStep> {
        let row = self.trace.get(self.cursor)?;
        self.cursor += 1;

        let timestamp = row.timestamp;
        let consumption_kwh = row.energy_kwh;
        let grid_connected = self.block.grid_connected().await;

        let charge = if grid_connected {
            self.config.charge_rate_kwh
        } else {
            0.0
        };
        self.soc_kwh =
            (self.soc_kwh + charge - consumption_kwh).clamp(0.0, self.config.capacity_kwh);

        self.block
            .publish_state(
                soc_percent(self.soc_kwh, self.config.capacity_kwh),
                // kWh over one hour is the mean kW; float casts saturate.
                consumption_kwh as u16,
                timestamp.hour() as u16,
                encode_date_words(date_to_yyyymmdd(timestamp.date())),
            )
            .await;

        Some(SimulatorStep {
            timestamp,
            grid_connected,
            consumption_kwh,
            soc_kwh: self.soc_kwh,
        })
    }

    /// Step once per `tick` until the trace ends or `shutdown` fires.
    pub async fn run(&mut self, tick: std::time::Duration, shutdown: CancellationToken) {
        info!(rows = self.trace.len(), ?tick, "device simulator started");
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(step) = self.step().await else {
                info!("consumption trace exhausted");
                break;
            };
            debug!(
                timestamp = %step.timestamp,
                grid_connected = step.grid_connected,
                consumption_kwh = step.consumption_kwh,
                soc_kwh = step.soc_kwh,
                "simulated hour"
            );
        }
        info!(soc_kwh = self.soc_kwh, "device simulator stopped");
    }
}

fn soc_percent(soc_kwh: f64, capacity_kwh: f64) -> u16 {
    if capacity_kwh <= 0.0 {
        return 0;
    }
    (soc_kwh / capacity_kwh * 100.0).clamp(0.0, 100.0) as u16
}
