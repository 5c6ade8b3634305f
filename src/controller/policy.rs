//! Grid pre-charge decision

use serde::{Deserialize, Serialize};

/// Overnight pre-charge rule.
///
/// Connect only when tomorrow's forecast plus a safety margin exceeds the
/// stored energy, the battery is below its cap, and it is still early.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlPolicy {
    /// Extra energy to hold, as a fraction of capacity
    pub safety_margin: f64,
    /// Never charge above this fraction of capacity
    pub soc_cap: f64,
    /// Charging is allowed only strictly before this hour
    pub precharge_before_hour: u16,
}

impl Default for ControlPolicy {
    fn default() -> Self {
        Self {
            safety_margin: 0.15,
            soc_cap: 0.9,
            precharge_before_hour: 8,
        }
    }
}

impl ControlPolicy {
    pub fn should_connect(
        &self,
        soc_kwh: f64,
        forecast_kwh: f64,
        hour: u16,
        capacity_kwh: f64,
    ) -> bool {
        // No model output yet.
        if forecast_kwh == 0.0 {
            return false;
        }
        soc_kwh < forecast_kwh + self.safety_margin * capacity_kwh
            && hour < self.precharge_before_hour
            && soc_kwh < self.soc_cap * capacity_kwh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero_forecast_dominates(50.0, 0.0, 3, false)]
    #[case::needs_precharge(20.0, 100.0, 3, true)]
    #[case::above_cap(230.0, 100.0, 3, false)]
    #[case::enough_stored(140.0, 100.0, 3, false)]
    #[case::just_below_margin(135.9, 100.0, 3, true)]
    #[case::too_late(20.0, 100.0, 8, false)]
    #[case::last_allowed_hour(20.0, 100.0, 7, true)]
    fn test_should_connect(
        #[case] soc_kwh: f64,
        #[case] forecast_kwh: f64,
        #[case] hour: u16,
        #[case] expected: bool,
    ) {
        let policy = ControlPolicy::default();
        assert_eq!(policy.should_connect(soc_kwh, forecast_kwh, hour, 240.0), expected);
    }

    #[test]
    fn test_cap_applies_even_with_large_forecast() {
        let policy = ControlPolicy::default();
        assert!(!policy.should_connect(216.0, 1000.0, 0, 240.0));
        assert!(policy.should_connect(215.9, 1000.0, 0, 240.0));
    }
}
