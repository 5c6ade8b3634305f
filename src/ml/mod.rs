//! Machine Learning Module
//!
//! Online learning capabilities behind the demand forecaster:
//! - Incremental regression (`OnlineRegressor`, Hoeffding tree implementation)
//! - Concept drift detection (`DriftDetector`, ADWIN implementation)
//! - Versioned model persistence with load-or-fresh semantics

pub mod drift;
pub mod hoeffding;
pub mod store;

pub use drift::{Adwin, AdwinConfig, DriftDetector};
pub use hoeffding::{HoeffdingTreeConfig, HoeffdingTreeRegressor};
pub use store::{FileModelStore, ModelStore, StoreError};

use crate::forecast::FeatureRecord;

/// Incremental regressor learning one example at a time.
///
/// `predict` never mutates state and returns 0.0 before any example was learned.
pub trait OnlineRegressor: Send {
    fn predict(&self, features: &FeatureRecord) -> f64;

    fn learn(&mut self, features: &FeatureRecord, target: f64);

    /// A fresh, untrained instance with the same hyperparameters.
    fn reset(&self) -> Self
    where
        Self: Sized;

    fn samples_seen(&self) -> u64;
}

/// Feed every observation to `model` in order; returns how many were learned.
pub fn learn_all<'a, M: OnlineRegressor>(
    model: &mut M,
    observations: impl IntoIterator<Item = &'a crate::domain::Observation>,
) -> usize {
    let mut learned = 0;
    for obs in observations {
        model.learn(&obs.features, obs.energy_kwh);
        learned += 1;
    }
    learned
}
