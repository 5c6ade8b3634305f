//! Historical consumption source and per-day archive.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::FeatureExtractor;
use crate::domain::Observation;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Unparseable timestamp '{0}'")]
    Timestamp(String),
    #[error("Timestamp '{0}' is outside years 1000-9999")]
    OutOfRange(String),
    #[error("No observations recorded for {date}")]
    DataGap { date: NaiveDate },
}

/// Read access to recorded observations, grouped by calendar date.
pub trait HistoricalSource: Send + Sync {
    /// Observations of one date; `DataGap` when the date is absent.
    fn observations_on(&self, date: NaiveDate) -> Result<Vec<Observation>, HistoryError>;

    /// Observations with `first <= date <= last`, in timestamp order.
    fn observations_between(
        &self,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<Vec<Observation>, HistoryError>;
}

/// Sink for a finished day's observations.
pub trait DayArchive: Send + Sync {
    fn persist(&self, date: NaiveDate, observations: &[Observation]) -> Result<(), HistoryError>;
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    #[serde(alias = "energia_kWh", alias = "energy_kWh")]
    energy_kwh: f64,
}

/// In-memory observation log, typically loaded from a CSV export.
#[derive(Debug, Clone, Default)]
pub struct ObservationLog {
    by_date: BTreeMap<NaiveDate, Vec<Observation>>,
}

impl ObservationLog {
    pub fn from_observations(observations: impl IntoIterator<Item = Observation>) -> Self {
        let mut by_date: BTreeMap<NaiveDate, Vec<Observation>> = BTreeMap::new();
        for obs in observations {
            by_date.entry(obs.date()).or_default().push(obs);
        }
        for day in by_date.values_mut() {
            day.sort_by_key(|o| o.timestamp);
        }
        Self { by_date }
    }

    /// Load `timestamp,energy_kwh` rows; other columns are ignored.
    pub fn from_csv_path(path: &Path, extractor: &FeatureExtractor) -> Result<Self, HistoryError> {
        let file = fs::File::open(path)?;
        let log = Self::from_csv_reader(file, extractor)?;
        debug!(path = %path.display(), days = log.days(), "loaded observation log");
        Ok(log)
    }

    pub fn from_csv_reader(
        reader: impl Read,
        extractor: &FeatureExtractor,
    ) -> Result<Self, HistoryError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut observations = Vec::new();
        for row in rdr.deserialize::<CsvRow>() {
            let row = row?;
            let timestamp = parse_timestamp(&row.timestamp)?;
            observations.push(Observation {
                timestamp,
                features: extractor.extract(timestamp),
                energy_kwh: row.energy_kwh,
            });
        }
        Ok(Self::from_observations(observations))
    }

    pub fn days(&self) -> usize {
        self.by_date.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    /// Every observation in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.by_date.values().flatten()
    }
}

impl HistoricalSource for ObservationLog {
    fn observations_on(&self, date: NaiveDate) -> Result<Vec<Observation>, HistoryError> {
        self.by_date
            .get(&date)
            .cloned()
            .ok_or(HistoryError::DataGap { date })
    }

    fn observations_between(
        &self,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<Vec<Observation>, HistoryError> {
        if first > last {
            return Ok(Vec::new());
        }
        Ok(self
            .by_date
            .range(first..=last)
            .flat_map(|(_, day)| day.iter().cloned())
            .collect())
    }
}

/// Accepts `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or RFC 3339 (offset dropped).
///
/// Years must fit the four-digit `YYYYMMDD` register encoding.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, HistoryError> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];
    let timestamp = FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_local()))
        .ok_or_else(|| HistoryError::Timestamp(raw.to_string()))?;
    if !(1000..=9999).contains(&timestamp.year()) {
        return Err(HistoryError::OutOfRange(raw.to_string()));
    }
    Ok(timestamp)
}

/// Writes each finished day to `<dir>/<YYYY-MM-DD>.csv`.
#[derive(Debug, Clone)]
pub struct CsvDayArchive {
    dir: PathBuf,
}

impl CsvDayArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.csv", date.format("%Y-%m-%d")))
    }
}

impl DayArchive for CsvDayArchive {
    fn persist(&self, date: NaiveDate, observations: &[Observation]) -> Result<(), HistoryError> {
        if observations.is_empty() {
            return Ok(());
        }
        let mut wtr = csv::Writer::from_path(self.path_for(date))?;
        wtr.write_record(["timestamp", "energy_kwh", "day_type"])?;
        for obs in observations {
            wtr.write_record(&[
                obs.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                format!("{:.4}", obs.energy_kwh),
                obs.features.day_type().to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Archive that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardArchive;

impl DayArchive for DiscardArchive {
    fn persist(&self, _date: NaiveDate, _observations: &[Observation]) -> Result<(), HistoryError> {
        Ok(())
    }
}
