use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::ControlPolicy;
use crate::forecast::ForecastSettings;
use crate::ml::{AdwinConfig, HoeffdingTreeConfig};
use crate::simulation::DeviceConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "GRIDCAST__";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceEndpoint,
    pub simulation: SimulationConfig,
    pub battery: BatteryConfig,
    pub control: ControlConfig,
    pub forecast: ForecastConfig,
    pub model: HoeffdingTreeConfig,
    pub drift: AdwinConfig,
    pub data: DataConfig,
    pub logging: LoggingConfig,
}

/// Where the register block is served / reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout_ms: u64,
}

impl Default for DeviceEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5020,
            unit_id: 1,
            timeout_ms: 1000,
        }
    }
}

impl DeviceEndpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Real seconds per simulated hour
    pub seconds_per_hour: f64,
    pub initial_soc_percent: f64,
    pub charge_rate_kwh: f64,
    pub initially_connected: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seconds_per_hour: 2.0,
            initial_soc_percent: 50.0,
            charge_rate_kwh: 45.0,
            initially_connected: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryConfig {
    pub capacity_kwh: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 240.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    pub safety_margin: f64,
    pub soc_cap: f64,
    pub precharge_before_hour: u16,
    pub poll_seconds: f64,
    pub retry_delay_seconds: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let policy = ControlPolicy::default();
        Self {
            safety_margin: policy.safety_margin,
            soc_cap: policy.soc_cap,
            precharge_before_hour: policy.precharge_before_hour,
            poll_seconds: 2.0,
            retry_delay_seconds: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub model_path: PathBuf,
    pub history_dir: PathBuf,
    pub retrain_window_days: u32,
    pub retention_days: u32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        let settings = ForecastSettings::default();
        Self {
            model_path: "data/model.bin".into(),
            history_dir: "data/history".into(),
            retrain_window_days: settings.retrain_window_days,
            retention_days: settings.retention_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Consumption trace replayed by the device simulator
    pub trace_path: PathBuf,
    /// Historical observations read by the controller
    pub history_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            trace_path: "data/consumption.csv".into(),
            history_path: "data/consumption.csv".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub json: bool,
}

impl Config {
    /// Built-in defaults, then `config/default.toml`, then `extra`, then `GRIDCAST__*` env vars.
    pub fn load(extra: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(DEFAULT_CONFIG_PATH));
        if let Some(path) = extra {
            if !path.exists() {
                anyhow::bail!("configuration file {} not found", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }
        let cfg: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("failed to load configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.trim().is_empty() {
            return Err(invalid("device.host", "must not be empty"));
        }
        if self.device.timeout_ms == 0 {
            return Err(invalid("device.timeout_ms", "must be positive"));
        }
        if !(self.battery.capacity_kwh.is_finite() && self.battery.capacity_kwh > 0.0) {
            return Err(invalid(
                "battery.capacity_kwh",
                format!("must be positive, got {}", self.battery.capacity_kwh),
            ));
        }
        if !(0.0..=100.0).contains(&self.simulation.initial_soc_percent) {
            return Err(invalid(
                "simulation.initial_soc_percent",
                format!("must be within 0-100, got {}", self.simulation.initial_soc_percent),
            ));
        }
        if !(self.simulation.charge_rate_kwh >= 0.0) {
            return Err(invalid("simulation.charge_rate_kwh", "must not be negative"));
        }
        if !is_delay(self.simulation.seconds_per_hour) {
            return Err(invalid(
                "simulation.seconds_per_hour",
                format!("must be a positive duration, got {}", self.simulation.seconds_per_hour),
            ));
        }
        for (field, value) in [
            ("control.safety_margin", self.control.safety_margin),
            ("control.soc_cap", self.control.soc_cap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("must be a fraction, got {value}")));
            }
        }
        if self.control.precharge_before_hour > 24 {
            return Err(invalid(
                "control.precharge_before_hour",
                format!("must be at most 24, got {}", self.control.precharge_before_hour),
            ));
        }
        for (field, value) in [
            ("control.poll_seconds", self.control.poll_seconds),
            ("control.retry_delay_seconds", self.control.retry_delay_seconds),
        ] {
            if !is_delay(value) {
                return Err(invalid(field, format!("must be a positive duration, got {value}")));
            }
        }
        if self.forecast.retrain_window_days == 0 {
            return Err(invalid("forecast.retrain_window_days", "must be at least 1"));
        }
        if self.forecast.retention_days < self.forecast.retrain_window_days {
            return Err(invalid(
                "forecast.retention_days",
                "must cover the retraining window",
            ));
        }
        if !(self.model.split_confidence > 0.0 && self.model.split_confidence < 1.0) {
            return Err(invalid("model.split_confidence", "must be within (0, 1)"));
        }
        if self.model.grace_period == 0 {
            return Err(invalid("model.grace_period", "must be at least 1"));
        }
        if !(self.drift.delta > 0.0 && self.drift.delta < 1.0) {
            return Err(invalid("drift.delta", "must be within (0, 1)"));
        }
        if self.drift.clock == 0 || self.drift.max_window < 2 * self.drift.min_window_length {
            return Err(invalid(
                "drift",
                "clock must be positive and max_window must hold two minimum sub-windows",
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> ControlPolicy {
        ControlPolicy {
            safety_margin: self.control.safety_margin,
            soc_cap: self.control.soc_cap,
            precharge_before_hour: self.control.precharge_before_hour,
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            capacity_kwh: self.battery.capacity_kwh,
            charge_rate_kwh: self.simulation.charge_rate_kwh,
            initial_soc_percent: self.simulation.initial_soc_percent,
            initially_connected: self.simulation.initially_connected,
        }
    }

    pub fn forecast_settings(&self) -> ForecastSettings {
        ForecastSettings {
            retrain_window_days: self.forecast.retrain_window_days,
            retention_days: self.forecast.retention_days,
        }
    }
}

/// Positive and representable as a `Duration`; rejects NaN and infinities.
fn is_delay(seconds: f64) -> bool {
    seconds > 0.0 && std::time::Duration::try_from_secs_f64(seconds).is_ok()
}
