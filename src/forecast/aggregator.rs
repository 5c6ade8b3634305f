//! Per-day accumulation of realized consumption and predictions.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Realized and predicted energy for one calendar date
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyTotals {
    pub actual_kwh: f64,
    pub predicted_kwh: f64,
    pub actual_samples: usize,
    pub predicted_samples: usize,
}

impl DailyTotals {
    pub fn has_prediction(&self) -> bool {
        self.predicted_samples > 0
    }
}

/// Daily totals keyed by date, optionally bounded to a trailing window.
#[derive(Debug, Clone, Default)]
pub struct DailyAggregator {
    days: BTreeMap<NaiveDate, DailyTotals>,
    retention_days: Option<u32>,
}

impl DailyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the `days` most recent dates after each [`prune`](Self::prune).
    pub fn with_retention(days: u32) -> Self {
        Self {
            days: BTreeMap::new(),
            retention_days: Some(days.max(1)),
        }
    }

    pub fn record_actual(&mut self, timestamp: NaiveDateTime, energy_kwh: f64) {
        let entry = self.days.entry(timestamp.date()).or_default();
        entry.actual_kwh += energy_kwh;
        entry.actual_samples += 1;
    }

    pub fn record_prediction(&mut self, timestamp: NaiveDateTime, energy_kwh: f64) {
        let entry = self.days.entry(timestamp.date()).or_default();
        entry.predicted_kwh += energy_kwh;
        entry.predicted_samples += 1;
    }

    /// Make sure a date is present even when no samples arrived for it.
    pub fn touch(&mut self, date: NaiveDate) {
        self.days.entry(date).or_default();
    }

    pub fn totals(&self, date: NaiveDate) -> Option<&DailyTotals> {
        self.days.get(&date)
    }

    pub fn actual_total(&self, date: NaiveDate) -> f64 {
        self.totals(date).map(|t| t.actual_kwh).unwrap_or(0.0)
    }

    /// Forecast total for a date, if one was ever produced.
    pub fn forecast_total(&self, date: NaiveDate) -> Option<f64> {
        self.totals(date)
            .filter(|t| t.has_prediction())
            .map(|t| t.predicted_kwh)
    }

    /// Relative error of the forecast produced for `date`, if there was one.
    pub fn relative_error(&self, date: NaiveDate) -> Option<f64> {
        let forecast = self.forecast_total(date)?;
        Some(relative_error(self.actual_total(date), forecast))
    }

    /// Drop dates older than the retention window ending at `latest`.
    pub fn prune(&mut self, latest: NaiveDate) {
        if let Some(days) = self.retention_days {
            let oldest = latest - chrono::Duration::days(i64::from(days) - 1);
            self.days.retain(|date, _| *date >= oldest);
        }
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.days.keys().copied()
    }
}

/// `|actual - forecast| / actual`, or 0 when nothing was consumed.
pub fn relative_error(actual_kwh: f64, forecast_kwh: f64) -> f64 {
    if actual_kwh == 0.0 {
        return 0.0;
    }
    (actual_kwh - forecast_kwh).abs() / actual_kwh.abs()
}
