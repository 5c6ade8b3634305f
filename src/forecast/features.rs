//! Feature engineering for the demand forecaster
//!
//! Maps an hourly timestamp to the fixed-shape record the regressor learns from.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::domain::HolidayCalendar;

/// First and last hour (inclusive) of the daily EV charging peak
pub const CHARGING_HOURS: std::ops::RangeInclusive<u32> = 9..=11;

/// Number of numeric features produced by [`FeatureRecord::to_vector`]
pub const FEATURE_COUNT: usize = 7;

/// Kind of day; holiday takes precedence over weekend, weekend over working day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DayType {
    Holiday,
    Weekend,
    WorkingDay,
}

/// Feature vector for one hourly slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Hour of day (0-23)
    pub hour: u32,
    /// Day of week (0=Monday, 6=Sunday)
    pub day_of_week: u32,
    /// Month (1-12)
    pub month: u32,
    pub is_charging_hour: bool,
    pub day_type_holiday: bool,
    pub day_type_weekend: bool,
    pub day_type_working_day: bool,
}

impl FeatureRecord {
    pub fn day_type(&self) -> DayType {
        if self.day_type_holiday {
            DayType::Holiday
        } else if self.day_type_weekend {
            DayType::Weekend
        } else {
            DayType::WorkingDay
        }
    }

    /// Numeric encoding in field declaration order; booleans become 0/1.
    pub fn to_vector(&self) -> [f64; FEATURE_COUNT] {
        [
            self.hour as f64,
            self.day_of_week as f64,
            self.month as f64,
            flag(self.is_charging_hour),
            flag(self.day_type_holiday),
            flag(self.day_type_weekend),
            flag(self.day_type_working_day),
        ]
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Feature extractor backed by a holiday calendar
#[derive(Clone)]
pub struct FeatureExtractor {
    calendar: Arc<dyn HolidayCalendar>,
}

impl FeatureExtractor {
    pub fn new(calendar: Arc<dyn HolidayCalendar>) -> Self {
        Self { calendar }
    }

    /// Extract features from a timestamp
    pub fn extract(&self, timestamp: NaiveDateTime) -> FeatureRecord {
        let date = timestamp.date();
        let hour = timestamp.hour();
        let day_of_week = date.weekday().num_days_from_monday();

        let day_type = if self.calendar.is_holiday(date) {
            DayType::Holiday
        } else if day_of_week >= 5 {
            DayType::Weekend
        } else {
            DayType::WorkingDay
        };

        FeatureRecord {
            hour,
            day_of_week,
            month: date.month(),
            is_charging_hour: CHARGING_HOURS.contains(&hour),
            day_type_holiday: day_type == DayType::Holiday,
            day_type_weekend: day_type == DayType::Weekend,
            day_type_working_day: day_type == DayType::WorkingDay,
        }
    }

    /// Feature records for every hour of `date`, derived without any realized data.
    pub fn day_schedule(&self, date: NaiveDate) -> Vec<FeatureRecord> {
        hourly_slots(date).map(|ts| self.extract(ts)).collect()
    }
}

/// The 24 hourly timestamps of a calendar date
pub fn hourly_slots(date: NaiveDate) -> impl Iterator<Item = NaiveDateTime> {
    (0..24u32).filter_map(move |h| NaiveTime::from_hms_opt(h, 0, 0).map(|t| date.and_time(t)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NoHolidays, SpanishHolidays};
    use proptest::prelude::*;
    use rstest::rstest;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn spanish() -> FeatureExtractor {
        FeatureExtractor::new(Arc::new(SpanishHolidays))
    }

    #[rstest]
    #[case(8, false)]
    #[case(9, true)]
    #[case(10, true)]
    #[case(11, true)]
    #[case(12, false)]
    fn test_charging_hour(#[case] hour: u32, #[case] expected: bool) {
        let f = spanish().extract(ts(2023, 3, 15, hour));
        assert_eq!(f.is_charging_hour, expected);
    }

    #[rstest]
    // Wednesday
    #[case(ts(2023, 3, 15, 12), DayType::WorkingDay)]
    // Saturday
    #[case(ts(2023, 3, 18, 12), DayType::Weekend)]
    // Fiesta Nacional, Thursday
    #[case(ts(2023, 10, 12, 12), DayType::Holiday)]
    // Día de la Constitución 2026 falls on a Sunday: holiday wins over weekend
    #[case(ts(2026, 12, 6, 12), DayType::Holiday)]
    fn test_day_type_precedence(#[case] timestamp: NaiveDateTime, #[case] expected: DayType) {
        assert_eq!(spanish().extract(timestamp).day_type(), expected);
    }

    #[test]
    fn test_calendar_fields() {
        let f = spanish().extract(ts(2023, 7, 2, 23));
        assert_eq!(f.hour, 23);
        assert_eq!(f.day_of_week, 6);
        assert_eq!(f.month, 7);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = spanish();
        let t = ts(2024, 3, 29, 10);
        assert_eq!(extractor.extract(t), extractor.extract(t));
    }

    #[test]
    fn test_day_schedule_has_24_hours() {
        let schedule = FeatureExtractor::new(Arc::new(NoHolidays))
            .day_schedule(NaiveDate::from_ymd_opt(2023, 5, 2).unwrap());
        assert_eq!(schedule.len(), 24);
        assert!(schedule.iter().enumerate().all(|(i, f)| f.hour == i as u32));
    }

    #[test]
    fn test_vector_encoding() {
        let f = spanish().extract(ts(2023, 3, 18, 10));
        assert_eq!(f.to_vector(), [10.0, 5.0, 3.0, 1.0, 0.0, 1.0, 0.0]);
    }

    proptest! {
        #[test]
        fn day_type_is_one_hot(days in 0i64..20_000, hour in 0u32..24) {
            let date = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap() + chrono::Duration::days(days);
            let f = spanish().extract(date.and_hms_opt(hour, 0, 0).unwrap());
            let hot = [f.day_type_holiday, f.day_type_weekend, f.day_type_working_day]
                .iter()
                .filter(|b| **b)
                .count();
            prop_assert_eq!(hot, 1);
            prop_assert_eq!(f.is_charging_hour, (9..=11).contains(&hour));
        }
    }
}
