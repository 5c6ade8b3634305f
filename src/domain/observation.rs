use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::forecast::FeatureRecord;

/// One hourly consumption sample with its derived features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: NaiveDateTime,
    pub features: FeatureRecord,
    /// Energy consumed during the hour (kWh)
    pub energy_kwh: f64,
}

impl Observation {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Total realized consumption of a set of observations.
pub fn total_energy(observations: &[Observation]) -> f64 {
    observations.iter().map(|o| o.energy_kwh).sum()
}
