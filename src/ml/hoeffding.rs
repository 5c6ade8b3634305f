//! Hoeffding tree regressor
//!
//! Leaves predict the running mean of their targets. A leaf is split once the
//! Hoeffding bound shows, with confidence `1 - split_confidence`, that the best
//! variance-reduction split beats the runner-up feature.

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::OnlineRegressor;
use crate::forecast::{FeatureRecord, FEATURE_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoeffdingTreeConfig {
    /// Samples a leaf must see between split attempts
    pub grace_period: u32,
    /// Minimum samples in a leaf before it may split
    pub min_samples_split: u32,
    /// Allowed probability of choosing the wrong split (delta)
    pub split_confidence: f64,
    /// Split anyway when the bound falls below this value
    pub tie_threshold: f64,
    pub max_depth: Option<u32>,
}

impl Default for HoeffdingTreeConfig {
    fn default() -> Self {
        Self {
            grace_period: 10,
            min_samples_split: 5,
            split_confidence: 1e-7,
            tie_threshold: 0.05,
            max_depth: None,
        }
    }
}

/// Running count, mean and sum of squared deviations (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct TargetStats {
    n: f64,
    mean: f64,
    m2: f64,
}

impl TargetStats {
    fn push(&mut self, y: f64) {
        self.n += 1.0;
        let delta = y - self.mean;
        self.mean += delta / self.n;
        self.m2 += delta * (y - self.mean);
    }

    fn merge(&self, other: &Self) -> Self {
        if self.n == 0.0 {
            return *other;
        }
        if other.n == 0.0 {
            return *self;
        }
        let n = self.n + other.n;
        let delta = other.mean - self.mean;
        Self {
            n,
            mean: self.mean + delta * other.n / n,
            m2: self.m2 + other.m2 + delta * delta * self.n * other.n / n,
        }
    }

    fn variance(&self) -> f64 {
        if self.n > 1.0 {
            (self.m2 / self.n).max(0.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Leaf {
    stats: TargetStats,
    /// Per feature: target statistics for each observed feature value
    observers: Vec<BTreeMap<OrderedFloat<f64>, TargetStats>>,
    observed: f64,
    observed_at_last_attempt: f64,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    merit: f64,
    left: TargetStats,
    right: TargetStats,
}

impl Leaf {
    fn new(stats: TargetStats) -> Self {
        Self {
            stats,
            observers: vec![BTreeMap::new(); FEATURE_COUNT],
            observed: 0.0,
            observed_at_last_attempt: 0.0,
        }
    }

    fn learn(&mut self, x: &[f64; FEATURE_COUNT], y: f64) {
        self.stats.push(y);
        self.observed += 1.0;
        for (observer, value) in self.observers.iter_mut().zip(x.iter()) {
            observer.entry(OrderedFloat(*value)).or_default().push(y);
        }
    }

    /// Best threshold on one feature by variance reduction ratio.
    fn best_split_on(&self, feature: usize) -> Option<SplitCandidate> {
        let observer = &self.observers[feature];
        if observer.len() < 2 {
            return None;
        }
        let total = observer
            .values()
            .fold(TargetStats::default(), |acc, s| acc.merge(s));
        let variance = total.variance();
        if variance <= 0.0 {
            return None;
        }

        let keys: Vec<f64> = observer.keys().map(|k| k.0).collect();
        let mut left = TargetStats::default();
        let mut best: Option<SplitCandidate> = None;

        for (i, stats) in observer.values().enumerate().take(keys.len() - 1) {
            left = left.merge(stats);
            let right = subtract(&total, &left);
            let weighted = (left.n * left.variance() + right.n * right.variance()) / total.n;
            let merit = (variance - weighted) / variance;
            if best.as_ref().map_or(true, |b| merit > b.merit) {
                best = Some(SplitCandidate {
                    feature,
                    threshold: (keys[i] + keys[i + 1]) / 2.0,
                    merit,
                    left,
                    right,
                });
            }
        }
        best
    }

    fn attempt_split(&mut self, depth: u32, config: &HoeffdingTreeConfig) -> Option<Node> {
        if config.max_depth.is_some_and(|max| depth >= max) {
            return None;
        }
        if self.observed - self.observed_at_last_attempt < f64::from(config.grace_period) {
            return None;
        }
        self.observed_at_last_attempt = self.observed;
        if self.observed < f64::from(config.min_samples_split) {
            return None;
        }

        let mut candidates: Vec<SplitCandidate> = (0..FEATURE_COUNT)
            .filter_map(|f| self.best_split_on(f))
            .collect();
        candidates.sort_by(|a, b| b.merit.total_cmp(&a.merit));

        let mut ranked = candidates.into_iter();
        let best = ranked.next()?;
        let runner_up = ranked.next().map_or(0.0, |c| c.merit);
        if best.merit <= 0.0 {
            return None;
        }

        // Merit is a ratio in [0, 1], so the range R is 1.
        let bound = ((1.0 / config.split_confidence).ln() / (2.0 * self.observed)).sqrt();
        if best.merit - runner_up > bound || bound < config.tie_threshold {
            Some(Node::Split {
                feature: best.feature,
                threshold: best.threshold,
                left: Box::new(Node::Leaf(Leaf::new(best.left))),
                right: Box::new(Node::Leaf(Leaf::new(best.right))),
            })
        } else {
            None
        }
    }
}

/// Statistics of `total` without the samples in `part`.
fn subtract(total: &TargetStats, part: &TargetStats) -> TargetStats {
    let n = total.n - part.n;
    if n <= 0.0 {
        return TargetStats::default();
    }
    let mean = (total.n * total.mean - part.n * part.mean) / n;
    let delta = mean - part.mean;
    let m2 = total.m2 - part.m2 - delta * delta * part.n * n / total.n;
    TargetStats {
        n,
        mean,
        m2: m2.max(0.0),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf(Leaf),
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn learn(&mut self, x: &[f64; FEATURE_COUNT], y: f64, depth: u32, config: &HoeffdingTreeConfig) {
        match self {
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if x[*feature] <= *threshold {
                    left.learn(x, y, depth + 1, config)
                } else {
                    right.learn(x, y, depth + 1, config)
                }
            }
            Node::Leaf(leaf) => {
                leaf.learn(x, y);
                if let Some(split) = leaf.attempt_split(depth, config) {
                    *self = split;
                }
            }
        }
    }

    fn predict(&self, x: &[f64; FEATURE_COUNT]) -> f64 {
        match self {
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if x[*feature] <= *threshold {
                    left.predict(x)
                } else {
                    right.predict(x)
                }
            }
            Node::Leaf(leaf) if leaf.stats.n > 0.0 => leaf.stats.mean,
            Node::Leaf(_) => 0.0,
        }
    }

    fn leaves(&self) -> usize {
        match self {
            Node::Leaf(_) => 1,
            Node::Split { left, right, .. } => left.leaves() + right.leaves(),
        }
    }

    fn depth(&self) -> u32 {
        match self {
            Node::Leaf(_) => 0,
            Node::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

/// Incremental regression tree with mean leaf prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoeffdingTreeRegressor {
    config: HoeffdingTreeConfig,
    root: Node,
    samples_seen: u64,
}

impl HoeffdingTreeRegressor {
    pub fn new(config: HoeffdingTreeConfig) -> Self {
        Self {
            config,
            root: Node::Leaf(Leaf::new(TargetStats::default())),
            samples_seen: 0,
        }
    }

    pub fn config(&self) -> &HoeffdingTreeConfig {
        &self.config
    }

    pub fn n_leaves(&self) -> usize {
        self.root.leaves()
    }

    pub fn depth(&self) -> u32 {
        self.root.depth()
    }
}

impl Default for HoeffdingTreeRegressor {
    fn default() -> Self {
        Self::new(HoeffdingTreeConfig::default())
    }
}

impl OnlineRegressor for HoeffdingTreeRegressor {
    fn predict(&self, features: &FeatureRecord) -> f64 {
        self.root.predict(&features.to_vector())
    }

    fn learn(&mut self, features: &FeatureRecord, target: f64) {
        let config = self.config;
        self.root.learn(&features.to_vector(), target, 0, &config);
        self.samples_seen += 1;
    }

    fn reset(&self) -> Self {
        Self::new(self.config)
    }

    fn samples_seen(&self) -> u64 {
        self.samples_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NoHolidays;
    use crate::forecast::FeatureExtractor;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn schedule(day: u32) -> Vec<FeatureRecord> {
        FeatureExtractor::new(Arc::new(NoHolidays))
            .day_schedule(NaiveDate::from_ymd_opt(2023, 3, day).unwrap())
    }

    #[test]
    fn test_untrained_predicts_zero() {
        let model = HoeffdingTreeRegressor::default();
        assert_eq!(model.predict(&schedule(1)[0]), 0.0);
        assert_eq!(model.samples_seen(), 0);
    }

    #[test]
    fn test_constant_target_is_learned_exactly() {
        let mut model = HoeffdingTreeRegressor::default();
        for f in schedule(1) {
            model.learn(&f, 3.0);
        }
        assert_eq!(model.predict(&schedule(2)[7]), 3.0);
        assert_eq!(model.n_leaves(), 1);
    }

    #[test]
    fn test_splits_on_hour_step() {
        let mut model = HoeffdingTreeRegressor::default();
        for day in 1..=10 {
            for f in schedule(day) {
                let y = if f.hour >= 12 { 10.0 } else { 1.0 };
                model.learn(&f, y);
            }
        }
        assert!(model.n_leaves() >= 2);
        let probe = schedule(11);
        assert!((model.predict(&probe[3]) - 1.0).abs() < 0.5);
        assert!((model.predict(&probe[18]) - 10.0).abs() < 0.5);
    }

    #[test]
    fn test_predict_does_not_mutate() {
        let mut model = HoeffdingTreeRegressor::default();
        for f in schedule(1) {
            model.learn(&f, f.hour as f64);
        }
        let before = model.samples_seen();
        let probe = schedule(2)[5];
        let first = model.predict(&probe);
        assert_eq!(model.predict(&probe), first);
        assert_eq!(model.samples_seen(), before);
    }

    #[test]
    fn test_reset_keeps_hyperparameters() {
        let config = HoeffdingTreeConfig {
            grace_period: 20,
            min_samples_split: 8,
            split_confidence: 1e-5,
            tie_threshold: 0.1,
            max_depth: Some(4),
        };
        let mut model = HoeffdingTreeRegressor::new(config);
        model.learn(&schedule(1)[0], 5.0);

        let fresh = model.reset();
        assert_eq!(fresh.samples_seen(), 0);
        assert_eq!(fresh.config(), &config);
        assert_eq!(fresh.predict(&schedule(1)[0]), 0.0);
    }

    #[test]
    fn test_max_depth_is_respected() {
        let config = HoeffdingTreeConfig {
            max_depth: Some(1),
            ..Default::default()
        };
        let mut model = HoeffdingTreeRegressor::new(config);
        for day in 1..=20 {
            for f in schedule(day) {
                model.learn(&f, (f.hour * f.hour) as f64);
            }
        }
        assert!(model.depth() <= 1);
    }

    #[test]
    fn test_stats_merge_matches_sequential() {
        let mut all = TargetStats::default();
        let mut a = TargetStats::default();
        let mut b = TargetStats::default();
        for (i, y) in [1.0, 4.0, 2.0, 8.0, 5.0, 7.0].iter().enumerate() {
            all.push(*y);
            if i < 3 {
                a.push(*y)
            } else {
                b.push(*y)
            }
        }
        let merged = a.merge(&b);
        assert!((merged.mean - all.mean).abs() < 1e-12);
        assert!((merged.variance() - all.variance()).abs() < 1e-9);

        let rest = subtract(&all, &a);
        assert!((rest.mean - b.mean).abs() < 1e-9);
        assert!((rest.variance() - b.variance()).abs() < 1e-9);
    }
}
