//! Controller loop scenarios against an in-memory register device.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use gridcast::controller::{ControlPolicy, ControllerClient, TickOutcome};
use gridcast::domain::{NoHolidays, Observation};
use gridcast::forecast::{
    hourly_slots, DayTransition, DayUpdate, FeatureExtractor, ForecastController,
    ForecastSettings, ObservationLog, TrainingMode,
};
use gridcast::ml::{
    learn_all, Adwin, DriftDetector, HoeffdingTreeConfig, HoeffdingTreeRegressor, ModelStore,
    OnlineRegressor, StoreError,
};
use gridcast::modbus::{RegisterDevice, RegisterFrame};

/// Flags drift whenever the latest error exceeds a threshold.
#[derive(Debug, Clone)]
struct ThresholdDrift {
    threshold: f64,
    flagged: bool,
}

impl ThresholdDrift {
    fn new(threshold: f64) -> Self {
        Self {
            threshold,
            flagged: false,
        }
    }
}

impl DriftDetector for ThresholdDrift {
    fn update(&mut self, value: f64) {
        self.flagged = value > self.threshold;
    }

    fn drift_detected(&self) -> bool {
        self.flagged
    }

    fn reset(&self) -> Self {
        Self::new(self.threshold)
    }
}

/// Store handle sharing its slot with the test body.
#[derive(Clone, Default)]
struct MemoryStore {
    model: Arc<Mutex<Option<HoeffdingTreeRegressor>>>,
    saves: Arc<Mutex<usize>>,
}

impl ModelStore<HoeffdingTreeRegressor> for MemoryStore {
    fn load(&self) -> Result<Option<HoeffdingTreeRegressor>, StoreError> {
        Ok(self.model.lock().unwrap().clone())
    }

    fn save(&self, model: &HoeffdingTreeRegressor) -> Result<(), StoreError> {
        *self.model.lock().unwrap() = Some(model.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedDevice {
    frames: Mutex<VecDeque<RegisterFrame>>,
    writes: Mutex<Vec<bool>>,
}

#[async_trait]
impl RegisterDevice for ScriptedDevice {
    async fn read_frame(&self) -> Result<RegisterFrame> {
        self.frames
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("device offline"))
    }

    async fn write_grid_connected(&self, connected: bool) -> Result<()> {
        self.writes.lock().unwrap().push(connected);
        Ok(())
    }
}

fn day(n: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 3, 6).unwrap() + Duration::days(n - 1)
}

fn extractor() -> FeatureExtractor {
    FeatureExtractor::new(Arc::new(NoHolidays))
}

fn history(days: impl IntoIterator<Item = i64>, kwh: impl Fn(i64) -> f64) -> ObservationLog {
    let extractor = extractor();
    let mut observations = Vec::new();
    for d in days {
        for timestamp in hourly_slots(day(d)) {
            observations.push(Observation {
                timestamp,
                features: extractor.extract(timestamp),
                energy_kwh: kwh(d),
            });
        }
    }
    ObservationLog::from_observations(observations)
}

fn forecaster(
    source: ObservationLog,
    store: MemoryStore,
    drift: ThresholdDrift,
) -> Forecaster {
    ForecastController::new(
        HoeffdingTreeRegressor::default(),
        drift,
        Box::new(store),
        Arc::new(source),
        extractor(),
        ForecastSettings::default(),
    )
}

fn step_change(d: i64) -> f64 {
    if d >= 3 {
        3.0
    } else {
        1.0
    }
}

type Forecaster = ForecastController<HoeffdingTreeRegressor, ThresholdDrift>;

/// Poll `days` full days of hourly frames; returns updates, grid writes and poll count.
async fn drive(days: i64, soc_percent: u16, forecaster: Forecaster) -> (Vec<DayUpdate>, Vec<bool>, usize) {
    let device = Arc::new(ScriptedDevice::default());
    {
        let mut frames = device.frames.lock().unwrap();
        for d in 1..=days {
            for hour in 0..24 {
                frames.push_back(RegisterFrame {
                    soc_percent,
                    demand_kw: 1,
                    grid_connected: false,
                    hour,
                    date: day(d),
                });
            }
        }
    }

    let mut client =
        ControllerClient::new(device.clone(), forecaster, ControlPolicy::default(), 240.0);
    let mut updates = Vec::new();
    let mut polls = 0;
    loop {
        match client.tick().await {
            TickOutcome::Unobservable => break,
            TickOutcome::Observed { day_update, .. } => {
                polls += 1;
                updates.extend(day_update);
            }
        }
    }
    client.finish().await;
    let writes = device.writes.lock().unwrap().clone();
    (updates, writes, polls)
}

#[tokio::test]
async fn test_one_update_per_date_change_not_per_poll() {
    let store = MemoryStore::default();
    let forecaster = forecaster(
        history(1..=5, |_| 1.0),
        store.clone(),
        ThresholdDrift::new(0.5),
    );

    let (updates, _, polls) = drive(5, 50, forecaster).await;

    assert_eq!(polls, 120);
    assert_eq!(updates.len(), 4);
    let days: Vec<_> = updates.iter().map(|u| (u.day, u.next_day)).collect();
    assert_eq!(
        days,
        vec![(day(1), day(2)), (day(2), day(3)), (day(3), day(4)), (day(4), day(5))]
    );
    // Persisted after every boundary.
    assert_eq!(*store.saves.lock().unwrap(), 4);
    assert!(updates.iter().all(|u| u.mode == TrainingMode::Incremental));
}

#[tokio::test]
async fn test_precharge_commands_follow_forecast_and_hour() {
    let forecaster = forecaster(
        history(1..=3, |_| 1.0),
        MemoryStore::default(),
        ThresholdDrift::new(0.5),
    );

    // 10 % of 240 kWh is below the 24 kWh forecast plus the 36 kWh margin.
    let (_, writes, _) = drive(3, 10, forecaster).await;

    // Day 1 has no forecast; days 2 and 3 connect at midnight and release at 08:00.
    assert_eq!(writes, vec![false, true, false, true, false]);
}

#[tokio::test]
async fn test_step_change_flips_drift_then_window_retrain() {
    let forecaster = forecaster(
        history(1..=5, step_change),
        MemoryStore::default(),
        ThresholdDrift::new(0.5),
    );

    let (updates, _, _) = drive(5, 50, forecaster).await;
    assert_eq!(updates.len(), 4);

    // First boundary has no earlier forecast to score.
    assert_eq!(updates[0].relative_error, None);
    // Day 2 was forecast exactly from day 1.
    assert_eq!(updates[1].relative_error, Some(0.0));
    assert!(!updates[1].drift_detected);

    // Day 3 consumed 72 kWh against a 24 kWh forecast.
    let flipped = &updates[2];
    assert_eq!(flipped.day, day(3));
    assert_eq!(flipped.mode, TrainingMode::Incremental);
    assert_eq!(flipped.actual_kwh, 72.0);
    let error = flipped.relative_error.unwrap();
    assert!((error - 2.0 / 3.0).abs() < 1e-12);
    assert!(flipped.drift_detected);

    // The next boundary retrains from scratch over the trailing window.
    let retrain = &updates[3];
    assert_eq!(retrain.mode, TrainingMode::WindowRetrain);
    assert_eq!(retrain.trained_samples, 4 * 24);
}

#[test]
fn test_adwin_catches_sustained_level_shift() {
    // 100 kWh/h for twelve days, then 1 kWh/h for good.
    let source = history(1..=45, |d| if d <= 12 { 100.0 } else { 1.0 });
    // Single leaf: every forecast is the running mean of all demand seen.
    let model = HoeffdingTreeRegressor::new(HoeffdingTreeConfig {
        max_depth: Some(0),
        ..Default::default()
    });
    let mut forecaster = ForecastController::new(
        model,
        Adwin::default(),
        Box::new(MemoryStore::default()),
        Arc::new(source),
        extractor(),
        ForecastSettings::default(),
    );

    let updates: Vec<DayUpdate> = (1..45)
        .map(|d| {
            forecaster.on_day_boundary(DayTransition {
                from: day(d),
                to: day(d + 1),
            })
        })
        .collect();

    let stable = &updates[1..12];
    assert!(stable.iter().all(|u| u.relative_error == Some(0.0)));
    assert!(updates[..12].iter().all(|u| !u.drift_detected));

    // The mean decays slowly towards the new level, so the error stays large
    // for weeks until the window holds enough evidence.
    let flagged = updates
        .iter()
        .position(|u| u.drift_detected)
        .expect("drift never detected");
    let flagged_day = flagged as i64 + 1;
    assert!((20..=40).contains(&flagged_day), "flagged on day {flagged_day}");
    assert!(updates[12..flagged].iter().all(|u| u.mode == TrainingMode::Incremental));

    let retrain = &updates[flagged + 1];
    assert_eq!(retrain.mode, TrainingMode::WindowRetrain);
    assert_eq!(retrain.trained_samples, 30 * 24);
    assert!(!retrain.drift_detected);
}

#[test]
fn test_window_retrain_ignores_older_observations() {
    // 1000 kWh/h long ago, 1 kWh/h in the 30 days ending at day 69.
    let source = history((1..=5).chain(40..=69), |d| if d <= 5 { 1000.0 } else { 1.0 });

    let mut stale = HoeffdingTreeRegressor::default();
    let old: Vec<_> = source
        .iter()
        .filter(|o| o.date() <= day(5))
        .cloned()
        .collect();
    learn_all(&mut stale, &old);
    let store = MemoryStore::default();
    *store.model.lock().unwrap() = Some(stale);

    let mut drift = ThresholdDrift::new(0.5);
    drift.update(1.0);
    let mut forecaster = forecaster(source, store, drift);
    assert_eq!(forecaster.model().samples_seen(), 5 * 24);

    let update = forecaster.on_day_boundary(DayTransition {
        from: day(69),
        to: day(70),
    });

    assert_eq!(update.mode, TrainingMode::WindowRetrain);
    assert_eq!(update.trained_samples, 30 * 24);
    assert_eq!(forecaster.model().samples_seen(), 30 * 24);
    assert_eq!(update.forecast_next_kwh, 24.0);
    for timestamp in hourly_slots(day(1)) {
        assert_eq!(forecaster.model().predict(&extractor().extract(timestamp)), 1.0);
    }
}

#[test]
fn test_zero_consumption_day_scores_zero_error() {
    let mut forecaster = forecaster(
        history(1..=3, |d| if d == 2 { 0.0 } else { 2.0 }),
        MemoryStore::default(),
        ThresholdDrift::new(0.5),
    );
    forecaster.on_day_boundary(DayTransition {
        from: day(1),
        to: day(2),
    });
    let update = forecaster.on_day_boundary(DayTransition {
        from: day(2),
        to: day(3),
    });

    assert_eq!(update.actual_kwh, 0.0);
    assert_eq!(update.relative_error, Some(0.0));
    assert!(!update.drift_detected);
}
