//! Trading Calendars
//!
//! A [`CalendarProvider`] answers one question: is the market open on a given
//! date. The period generator only ever asks for whole days, so session
//! times are carried separately in the period request.

use crate::dispatch::error::ConfigError;
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::BTreeSet;
use trading_calendar::{Market, TradingCalendar};

/// Source of calendar-valid session days.
pub trait CalendarProvider {
    /// True when `date` is a trading session day.
    fn is_session_day(&self, date: NaiveDate) -> bool;

    /// Calendar identifier for logging.
    fn name(&self) -> &str;

    /// True when every date in `[start, end]` can be answered. A calendar
    /// that cannot answer must not be read as "market closed".
    fn covers(&self, _start: NaiveDate, _end: NaiveDate) -> bool {
        true
    }

    /// Valid session days in `[start, end]`, ascending.
    fn valid_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut current = start;
        while current <= end {
            if self.is_session_day(current) {
                days.push(current);
            }
            match current.succ_opt() {
                Some(next) => current = next,
                None => break,
            }
        }
        days
    }
}

// =============================================================================
// EXCHANGE CALENDAR
// =============================================================================

/// Exchange holiday calendar backed by `trading_calendar`.
pub struct ExchangeCalendar {
    name: String,
    inner: TradingCalendar,
}

impl ExchangeCalendar {
    pub fn nyse() -> Result<Self, ConfigError> {
        let inner = TradingCalendar::new(Market::NYSE)
            .map_err(|e| ConfigError::invalid("calendar", format!("NYSE calendar unavailable: {:?}", e)))?;
        Ok(Self {
            name: "NYSE".to_string(),
            inner,
        })
    }
}

impl CalendarProvider for ExchangeCalendar {
    fn is_session_day(&self, date: NaiveDate) -> bool {
        // callers check `covers` first; anything outside it reads as closed
        self.inner.is_trading_day(date).unwrap_or(false)
    }

    fn name(&self) -> &str {
        &self.name
    }

    /// The holiday tables span a fixed range of years.
    fn covers(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.inner.is_trading_day(start).is_ok() && self.inner.is_trading_day(end).is_ok()
    }
}

// =============================================================================
// WEEKDAY CALENDAR
// =============================================================================

/// Monday to Friday, minus an explicit holiday list.
#[derive(Debug, Clone, Default)]
pub struct WeekdayCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl WeekdayCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_holidays(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }
}

impl CalendarProvider for WeekdayCalendar {
    fn is_session_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    fn name(&self) -> &str {
        "weekdays"
    }
}

// =============================================================================
// FIXED / CONTINUOUS CALENDARS
// =============================================================================

/// An explicit set of session days.
#[derive(Debug, Clone, Default)]
pub struct FixedCalendar {
    days: BTreeSet<NaiveDate>,
}

impl FixedCalendar {
    pub fn new(days: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            days: days.into_iter().collect(),
        }
    }
}

impl CalendarProvider for FixedCalendar {
    fn is_session_day(&self, date: NaiveDate) -> bool {
        self.days.contains(&date)
    }

    fn name(&self) -> &str {
        "fixed"
    }

    fn valid_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if start > end {
            return Vec::new();
        }
        self.days.range(start..=end).copied().collect()
    }
}

/// Every day is a session day (crypto, 24/7 venues).
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinuousCalendar;

impl CalendarProvider for ContinuousCalendar {
    fn is_session_day(&self, _date: NaiveDate) -> bool {
        true
    }

    fn name(&self) -> &str {
        "24/7"
    }
}

/// Resolve a calendar identifier from config.
///
/// Recognized: `NYSE`/`XNYS` (exchange holidays), `weekdays`, `24/7`/`always`.
pub fn calendar_from_name(
    name: &str,
    holidays: &[NaiveDate],
) -> Result<Box<dyn CalendarProvider>, ConfigError> {
    match name.trim().to_uppercase().as_str() {
        "NYSE" | "XNYS" => Ok(Box::new(ExchangeCalendar::nyse()?)),
        "WEEKDAYS" | "WEEKDAY" => Ok(Box::new(WeekdayCalendar::with_holidays(
            holidays.iter().copied(),
        ))),
        "24/7" | "ALWAYS" | "CONTINUOUS" => Ok(Box::new(ContinuousCalendar)),
        other => Err(ConfigError::invalid(
            "calendar",
            format!("unknown calendar '{}' (expected NYSE, weekdays or 24/7)", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_weekday_calendar_skips_weekends_and_holidays() {
        let cal = WeekdayCalendar::with_holidays([d(2023, 10, 9)]);
        // Fri 6th, Sat 7th, Sun 8th, Mon 9th (holiday), Tue 10th
        let days = cal.valid_days(d(2023, 10, 6), d(2023, 10, 10));
        assert_eq!(days, vec![d(2023, 10, 6), d(2023, 10, 10)]);
    }

    #[test]
    fn test_fixed_calendar_range() {
        let cal = FixedCalendar::new([d(2023, 10, 2), d(2023, 10, 3), d(2023, 11, 1)]);
        assert_eq!(cal.valid_days(d(2023, 10, 1), d(2023, 10, 31)).len(), 2);
        assert!(cal.valid_days(d(2023, 12, 1), d(2023, 12, 31)).is_empty());
    }

    #[test]
    fn test_nyse_coverage_is_bounded() {
        let cal = ExchangeCalendar::nyse().unwrap();
        assert!(cal.covers(d(2023, 10, 2), d(2023, 10, 6)));
        assert!(!cal.covers(d(1999, 1, 4), d(1999, 1, 8)));
        assert!(!cal.covers(d(2023, 1, 2), d(2099, 1, 2)));
        assert!(WeekdayCalendar::default().covers(d(1999, 1, 4), d(2099, 1, 2)));
    }

    #[test]
    fn test_calendar_from_name() {
        assert_eq!(calendar_from_name("weekdays", &[]).unwrap().name(), "weekdays");
        assert_eq!(calendar_from_name("24/7", &[]).unwrap().name(), "24/7");
        assert!(calendar_from_name("MOON", &[]).is_err());
    }
}
