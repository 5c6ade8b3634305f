//! Register layout and codec for the device block.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First holding register of the block
pub const BLOCK_START: u16 = 0;
/// Number of registers in the block
pub const REGISTER_COUNT: u16 = 7;

/// Holding-register addresses
pub mod address {
    pub const SOC_PERCENT: u16 = 0;
    pub const DEMAND_KW: u16 = 1;
    pub const RESERVED: u16 = 2;
    pub const GRID_CONNECTED: u16 = 3;
    pub const SIMULATED_HOUR: u16 = 4;
    pub const DATE_HIGH: u16 = 5;
    pub const DATE_LOW: u16 = 6;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Expected {expected} registers, got {found}")]
    Length { expected: usize, found: usize },
    #[error("State of charge out of range: {0}%")]
    SocPercent(u16),
    #[error("Grid flag must be 0 or 1, got {0}")]
    GridFlag(u16),
    #[error("Simulated hour out of range: {0}")]
    Hour(u16),
    #[error("Invalid YYYYMMDD date: {0}")]
    Date(u32),
}

/// Decoded register block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFrame {
    /// State of charge (0-100 %)
    pub soc_percent: u16,
    /// Instantaneous demand (kW, truncated)
    pub demand_kw: u16,
    pub grid_connected: bool,
    /// Simulated hour of day (0-23)
    pub hour: u16,
    pub date: NaiveDate,
}

impl RegisterFrame {
    pub fn encode(&self) -> [u16; REGISTER_COUNT as usize] {
        let [high, low] = encode_date_words(date_to_yyyymmdd(self.date));
        [
            self.soc_percent,
            self.demand_kw,
            0,
            u16::from(self.grid_connected),
            self.hour,
            high,
            low,
        ]
    }

    pub fn decode(words: &[u16]) -> Result<Self, FrameError> {
        if words.len() != REGISTER_COUNT as usize {
            return Err(FrameError::Length {
                expected: REGISTER_COUNT as usize,
                found: words.len(),
            });
        }
        let at = |addr: u16| words[addr as usize];

        let soc_percent = at(address::SOC_PERCENT);
        if soc_percent > 100 {
            return Err(FrameError::SocPercent(soc_percent));
        }
        let grid_connected = match at(address::GRID_CONNECTED) {
            0 => false,
            1 => true,
            other => return Err(FrameError::GridFlag(other)),
        };
        let hour = at(address::SIMULATED_HOUR);
        if hour > 23 {
            return Err(FrameError::Hour(hour));
        }
        let date = yyyymmdd_to_date(decode_date_words(
            at(address::DATE_HIGH),
            at(address::DATE_LOW),
        ))?;

        Ok(Self {
            soc_percent,
            demand_kw: at(address::DEMAND_KW),
            grid_connected,
            hour,
            date,
        })
    }

    /// State of charge in kWh for a battery of the given capacity.
    pub fn soc_kwh(&self, capacity_kwh: f64) -> f64 {
        f64::from(self.soc_percent) / 100.0 * capacity_kwh
    }
}

/// Split a date integer into `[high, low]` 16-bit words.
pub fn encode_date_words(value: u32) -> [u16; 2] {
    [((value >> 16) & 0xFFFF) as u16, (value & 0xFFFF) as u16]
}

/// `(high << 16) | low`
pub fn decode_date_words(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// `YYYYMMDD` for years 1000 through 9999; other years do not round-trip
/// and are rejected when observations are loaded.
pub fn date_to_yyyymmdd(date: NaiveDate) -> u32 {
    date.year() as u32 * 10_000 + date.month() * 100 + date.day()
}

/// Parse an 8-digit `YYYYMMDD` integer into a calendar date.
pub fn yyyymmdd_to_date(value: u32) -> Result<NaiveDate, FrameError> {
    if !(10_000_000..=99_999_999).contains(&value) {
        return Err(FrameError::Date(value));
    }
    NaiveDate::from_ymd_opt(
        (value / 10_000) as i32,
        value / 100 % 100,
        value % 100,
    )
    .ok_or(FrameError::Date(value))
}
