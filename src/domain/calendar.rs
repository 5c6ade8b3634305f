use chrono::{Datelike, NaiveDate, Weekday};

/// Capability answering whether a calendar date is a public holiday.
pub trait HolidayCalendar: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// Calendar without any holidays; every weekday is a working day.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHolidays;

impl HolidayCalendar for NoHolidays {
    fn is_holiday(&self, _date: NaiveDate) -> bool {
        false
    }
}

/// Spanish national public holidays.
///
/// Covers the fixed-date national holidays and Good Friday. Regional holidays
/// and Sunday substitutions are not modelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanishHolidays;

impl HolidayCalendar for SpanishHolidays {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        let fixed = matches!(
            (date.month(), date.day()),
            (1, 1)     // Año Nuevo
            | (1, 6)   // Epifanía del Señor
            | (5, 1)   // Fiesta del Trabajo
            | (8, 15)  // Asunción de la Virgen
            | (10, 12) // Fiesta Nacional de España
            | (11, 1)  // Todos los Santos
            | (12, 6)  // Día de la Constitución
            | (12, 8)  // Inmaculada Concepción
            | (12, 25) // Natividad del Señor
        );
        fixed || good_friday(date.year()) == Some(date)
    }
}

/// Gregorian Easter Sunday (anonymous Gregorian algorithm).
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

fn good_friday(year: i32) -> Option<NaiveDate> {
    let easter = easter_sunday(year)?;
    let friday = easter - chrono::Duration::days(2);
    debug_assert_eq!(friday.weekday(), Weekday::Fri);
    Some(friday)
}
