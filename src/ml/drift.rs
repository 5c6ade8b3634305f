//! Concept drift detection over a stream of scalar errors.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Online detector raising a flag when the input distribution shifts.
pub trait DriftDetector: Send {
    /// Append one observation and re-evaluate the window.
    fn update(&mut self, value: f64);

    /// Outcome of the most recent [`update`](Self::update).
    fn drift_detected(&self) -> bool;

    /// A fresh detector with empty history and the same parameters.
    fn reset(&self) -> Self
    where
        Self: Sized;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdwinConfig {
    /// Confidence parameter; smaller values make detection more conservative
    pub delta: f64,
    /// Check for cuts every `clock` updates
    pub clock: u32,
    /// Minimum size of each sub-window considered for a cut
    pub min_window_length: usize,
    /// Updates required before the first check
    pub grace_period: usize,
    /// Hard bound on retained observations
    pub max_window: usize,
}

impl Default for AdwinConfig {
    fn default() -> Self {
        Self {
            delta: 0.002,
            clock: 1,
            min_window_length: 5,
            grace_period: 10,
            max_window: 1000,
        }
    }
}

/// ADaptive WINdowing drift detector
///
/// Keeps a window of recent values and drops its older part whenever two
/// sub-windows have means that differ by more than the ADWIN cut threshold.
#[derive(Debug, Clone)]
pub struct Adwin {
    config: AdwinConfig,
    window: VecDeque<f64>,
    updates: u64,
    drift: bool,
    detections: u64,
}

impl Adwin {
    pub fn new(config: AdwinConfig) -> Self {
        Self {
            config,
            window: VecDeque::with_capacity(config.max_window.min(1024)),
            updates: 0,
            drift: false,
            detections: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.window.len()
    }

    pub fn detections(&self) -> u64 {
        self.detections
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Index of the first split point violating the cut condition.
    fn find_cut(&self) -> Option<usize> {
        let n = self.window.len();
        let min_len = self.config.min_window_length.max(1);
        if n < 2 * min_len {
            return None;
        }

        let total: f64 = self.window.iter().sum();
        let mean = total / n as f64;
        let variance = self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let delta_prime = (2.0 * (n as f64).ln() / self.config.delta).ln();

        let mut head = 0.0;
        for (i, value) in self.window.iter().enumerate().take(n - min_len) {
            head += value;
            let n0 = i + 1;
            if n0 < min_len {
                continue;
            }
            let n1 = n - n0;
            let mean0 = head / n0 as f64;
            let mean1 = (total - head) / n1 as f64;
            let m_recip = 1.0 / (n0 - min_len + 1) as f64 + 1.0 / (n1 - min_len + 1) as f64;
            let epsilon = (2.0 * m_recip * variance * delta_prime).sqrt()
                + 2.0 / 3.0 * delta_prime * m_recip;
            if (mean0 - mean1).abs() > epsilon {
                return Some(n0);
            }
        }
        None
    }
}

impl Default for Adwin {
    fn default() -> Self {
        Self::new(AdwinConfig::default())
    }
}

impl DriftDetector for Adwin {
    fn update(&mut self, value: f64) {
        self.drift = false;
        self.window.push_back(value);
        if self.window.len() > self.config.max_window.max(1) {
            self.window.pop_front();
        }
        self.updates += 1;

        if self.updates % u64::from(self.config.clock.max(1)) != 0
            || (self.updates as usize) < self.config.grace_period
        {
            return;
        }

        while let Some(cut) = self.find_cut() {
            self.window.drain(..cut);
            self.drift = true;
        }
        if self.drift {
            self.detections += 1;
        }
    }

    fn drift_detected(&self) -> bool {
        self.drift
    }

    fn reset(&self) -> Self {
        Self::new(self.config)
    }
}
