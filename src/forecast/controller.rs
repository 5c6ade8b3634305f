//! Day-boundary forecasting state machine
//!
//! Runs once per distinct simulated date: trains the model on the finished
//! day (or retrains it on a trailing window after drift), forecasts the new
//! day, scores yesterday's forecast and queues the model for persistence.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    hourly_slots, DailyAggregator, DayArchive, DiscardArchive, FeatureExtractor, HistoricalSource,
    HistoryError, Persistence,
};
use crate::domain::{total_energy, Observation};
use crate::ml::{learn_all, DriftDetector, ModelStore, OnlineRegressor};

/// Day-tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayState {
    AwaitingFirstDay,
    SteadyState { current: NaiveDate },
}

/// Emitted when the observed date changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayTransition {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Edge-triggered detector of date changes in the polled register stream
#[derive(Debug, Clone, Copy)]
pub struct DayTracker {
    state: DayState,
}

impl Default for DayTracker {
    fn default() -> Self {
        Self {
            state: DayState::AwaitingFirstDay,
        }
    }
}

impl DayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DayState {
        self.state
    }

    /// Returns a transition only when `date` differs from the current date.
    pub fn observe(&mut self, date: NaiveDate) -> Option<DayTransition> {
        match self.state {
            DayState::AwaitingFirstDay => {
                self.state = DayState::SteadyState { current: date };
                None
            }
            DayState::SteadyState { current } if current == date => None,
            DayState::SteadyState { current } => {
                self.state = DayState::SteadyState { current: date };
                Some(DayTransition {
                    from: current,
                    to: date,
                })
            }
        }
    }
}

/// How the model was brought up to date at a boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TrainingMode {
    /// Existing model updated with the finished day only
    Incremental,
    /// Fresh model trained on the trailing window after drift
    WindowRetrain,
}

/// Summary of one boundary update
#[derive(Debug, Clone, PartialEq)]
pub struct DayUpdate {
    pub day: NaiveDate,
    pub next_day: NaiveDate,
    pub mode: TrainingMode,
    pub trained_samples: usize,
    pub actual_kwh: f64,
    pub forecast_next_kwh: f64,
    /// Error of the forecast made for `day`, if one existed
    pub relative_error: Option<f64>,
    pub drift_detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastSettings {
    /// Length of the retraining window, ending at the finished day inclusive
    pub retrain_window_days: u32,
    /// Days of totals kept by the aggregator
    pub retention_days: u32,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            retrain_window_days: 30,
            retention_days: 60,
        }
    }
}

/// Owns the live model, the drift detector and the daily totals
pub struct ForecastController<M, D> {
    model: M,
    drift: D,
    persistence: Persistence<M>,
    source: Arc<dyn HistoricalSource>,
    extractor: FeatureExtractor,
    aggregator: DailyAggregator,
    settings: ForecastSettings,
    next_day_forecast: f64,
    updates: u64,
}

impl<M, D> ForecastController<M, D>
where
    M: OnlineRegressor + Clone + 'static,
    D: DriftDetector,
{
    /// Load the persisted model, or start from `template.reset()` when there is
    /// none or it cannot be read.
    pub fn new(
        template: M,
        drift: D,
        store: Box<dyn ModelStore<M>>,
        source: Arc<dyn HistoricalSource>,
        extractor: FeatureExtractor,
        settings: ForecastSettings,
    ) -> Self {
        let model = match store.load() {
            Ok(Some(model)) => {
                info!(samples = model.samples_seen(), "loaded persisted model");
                model
            }
            Ok(None) => {
                info!("no persisted model, starting fresh");
                template.reset()
            }
            Err(e) => {
                warn!(error = %e, "persisted model unusable, starting fresh");
                template.reset()
            }
        };

        Self {
            model,
            drift,
            persistence: Persistence::new(Arc::new(DiscardArchive), Arc::from(store)),
            source,
            extractor,
            aggregator: DailyAggregator::with_retention(settings.retention_days),
            settings,
            next_day_forecast: 0.0,
            updates: 0,
        }
    }

    pub fn with_archive(mut self, archive: Box<dyn DayArchive>) -> Self {
        self.persistence.set_archive(Arc::from(archive));
        self
    }

    /// Wait for queued archive and model writes.
    pub async fn flush(&mut self) {
        self.persistence.flush().await;
    }

    /// Total demand forecast for the current simulated day; 0 before the first boundary.
    pub fn next_day_forecast(&self) -> f64 {
        self.next_day_forecast
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn drift_detected(&self) -> bool {
        self.drift.drift_detected()
    }

    pub fn aggregator(&self) -> &DailyAggregator {
        &self.aggregator
    }

    /// Number of boundary updates performed so far
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn on_day_boundary(&mut self, transition: DayTransition) -> DayUpdate {
        let day = transition.from;
        let next_day = transition.to;

        let observations = self.finished_day(day);
        let actual_kwh = total_energy(&observations);
        self.aggregator.touch(day);
        for obs in &observations {
            self.aggregator.record_actual(obs.timestamp, obs.energy_kwh);
        }

        let (mode, trained_samples) = if self.drift.drift_detected() {
            (TrainingMode::WindowRetrain, self.retrain_on_window(day))
        } else {
            (
                TrainingMode::Incremental,
                learn_all(&mut self.model, &observations),
            )
        };

        let forecast_next_kwh = self.forecast(next_day);

        let relative_error = self.aggregator.relative_error(day);
        match relative_error {
            Some(error) => self.drift.update(error),
            None => debug!(%day, "no forecast was made for this day, drift detector not updated"),
        }

        self.persistence.save_model(self.model.clone());

        self.aggregator.prune(next_day);
        self.next_day_forecast = forecast_next_kwh;
        self.updates += 1;

        let update = DayUpdate {
            day,
            next_day,
            mode,
            trained_samples,
            actual_kwh,
            forecast_next_kwh,
            relative_error,
            drift_detected: self.drift.drift_detected(),
        };
        info!(
            %day,
            %next_day,
            %mode,
            trained_samples,
            actual_kwh,
            forecast_next_kwh,
            relative_error = relative_error.unwrap_or(0.0),
            drift_detected = update.drift_detected,
            "day boundary update"
        );
        update
    }

    /// Observations of a finished day, archived; a gap counts as zero demand.
    fn finished_day(&mut self, day: NaiveDate) -> Vec<Observation> {
        let observations = match self.source.observations_on(day) {
            Ok(observations) => observations,
            Err(HistoryError::DataGap { date }) => {
                warn!(%date, "no observations for day, treating as zero demand");
                Vec::new()
            }
            Err(e) => {
                warn!(%day, error = %e, "historical source failed, treating as zero demand");
                Vec::new()
            }
        };
        self.persistence.archive_day(day, observations.clone());
        observations
    }

    fn retrain_on_window(&mut self, day: NaiveDate) -> usize {
        let window = i64::from(self.settings.retrain_window_days.max(1));
        let first = day - Duration::days(window - 1);
        warn!(%first, last = %day, "drift detected, retraining on trailing window");

        let observations = self
            .source
            .observations_between(first, day)
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not read retraining window");
                Vec::new()
            });

        self.model = self.model.reset();
        self.drift = self.drift.reset();
        learn_all(&mut self.model, &observations)
    }

    fn forecast(&mut self, date: NaiveDate) -> f64 {
        let mut total = 0.0;
        for timestamp in hourly_slots(date) {
            let predicted = self.model.predict(&self.extractor.extract(timestamp));
            self.aggregator.record_prediction(timestamp, predicted);
            total += predicted;
        }
        total
    }
}
