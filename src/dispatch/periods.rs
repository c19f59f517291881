//! Period Generation
//!
//! Slices a historical range into ordered, non-overlapping, calendar-aware
//! [`Window`]s. This is the only place window boundaries are computed for
//! replay; the live path uses [`live_window`] from the same module so both
//! drivers agree on alignment.
//!
//! # Boundary Convention
//!
//! Construction works on natural boundaries (midnight, next N-minute slot,
//! first of next month). Whenever a natural boundary is used verbatim as a
//! window end, one microsecond is subtracted, so consecutive windows never
//! touch and a row stamped exactly on a boundary lands in exactly one window.
//! When the end is clipped by the caller's range or the session close instead,
//! the clipped instant is kept.
//!
//! # Effective End
//!
//! An `end` at exactly midnight means "through the end of that day": it is
//! widened to 23:59:59.999999 so a bare end date includes the whole day.

use crate::dispatch::calendar::CalendarProvider;
use crate::dispatch::error::ConfigError;
use crate::dispatch::window::{end_of_day, start_of_day, tick, Window};
use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

// =============================================================================
// FREQUENCY
// =============================================================================

/// Window granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    /// One window per calendar-valid day.
    Day,
    /// N-minute windows inside the trading session.
    Minutes(u32),
    /// One window per calendar month, trimmed to its valid trading days.
    Month,
}

impl Frequency {
    /// Sub-day frequencies need session open/close times.
    pub fn is_intraday(&self) -> bool {
        matches!(self, Self::Minutes(_))
    }

    /// Floor `t` to the start of the window containing it.
    pub fn align(&self, t: NaiveDateTime) -> NaiveDateTime {
        match self {
            Self::Day => start_of_day(t.date()),
            Self::Minutes(n) => {
                let n = (*n).max(1);
                let minute_of_day = t.hour() * 60 + t.minute();
                let slot = minute_of_day - minute_of_day % n;
                start_of_day(t.date()) + Duration::minutes(slot as i64)
            }
            Self::Month => start_of_day(first_of_month(t.date())),
        }
    }

    /// The boundary one unit after an aligned instant.
    pub fn advance(&self, aligned: NaiveDateTime) -> NaiveDateTime {
        match self {
            Self::Day => aligned + Duration::days(1),
            Self::Minutes(n) => aligned + Duration::minutes((*n).max(1) as i64),
            Self::Month => start_of_day(first_of_next_month(aligned.date())),
        }
    }

    /// First boundary strictly after `now`.
    pub fn next_boundary(&self, now: NaiveDateTime) -> NaiveDateTime {
        self.advance(self.align(now))
    }
}

impl FromStr for Frequency {
    type Err = ConfigError;

    /// Accepts `day`, `minute`, `N min` / `Nmin`, `month`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "day" | "daily" => return Ok(Self::Day),
            "minute" | "min" => return Ok(Self::Minutes(1)),
            "month" | "monthly" => return Ok(Self::Month),
            _ => {}
        }
        let invalid = || {
            ConfigError::invalid(
                "frequency",
                format!("'{}' (expected day, minute, 'N min' or month)", s),
            )
        };
        let n = s.strip_suffix("min").ok_or_else(invalid)?.trim();
        match n.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::Minutes(n)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Minutes(1) => write!(f, "minute"),
            Self::Minutes(n) => write!(f, "{} min", n),
            Self::Month => write!(f, "month"),
        }
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let first = first_of_month(date);
    first.checked_add_months(Months::new(1)).unwrap_or(first)
}

// =============================================================================
// PERIOD REQUEST
// =============================================================================

/// Everything the generator needs besides the calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodRequest {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub frequency: Frequency,
    pub open_time: Option<NaiveTime>,
    pub close_time: Option<NaiveTime>,
}

impl PeriodRequest {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime, frequency: Frequency) -> Self {
        Self {
            start,
            end,
            frequency,
            open_time: None,
            close_time: None,
        }
    }

    pub fn with_session(mut self, open: NaiveTime, close: NaiveTime) -> Self {
        self.open_time = Some(open);
        self.close_time = Some(close);
        self
    }

    /// `end`, or the last instant of its day when `end` is exactly midnight.
    pub fn effective_end(&self) -> NaiveDateTime {
        effective_end(self.end)
    }
}

/// Widen a bare-date end (midnight) to the last instant of that day.
pub fn effective_end(end: NaiveDateTime) -> NaiveDateTime {
    if end.time() == NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default() {
        end_of_day(end.date())
    } else {
        end
    }
}

// =============================================================================
// GENERATION
// =============================================================================

/// Generate the ordered window sequence for a historical range.
///
/// # Errors
///
/// `ConfigError` when a sub-day frequency has no session open/close, or when
/// `start > end`. An empty calendar range is not an error: it yields no
/// windows.
pub fn generate_periods(
    request: &PeriodRequest,
    calendar: &dyn CalendarProvider,
) -> Result<Vec<Window>, ConfigError> {
    if request.start > request.end {
        return Err(ConfigError::invalid(
            "historical_range",
            format!("start {} is after end {}", request.start, request.end),
        ));
    }
    check_coverage(request, calendar)?;

    let windows = match request.frequency {
        Frequency::Day => day_periods(request, calendar),
        Frequency::Minutes(interval) => {
            let open = request
                .open_time
                .ok_or_else(|| ConfigError::Missing("historical_range.open_time".to_string()))?;
            let close = request
                .close_time
                .ok_or_else(|| ConfigError::Missing("historical_range.close_time".to_string()))?;
            intraday_periods(request, calendar, interval, open, close)
        }
        Frequency::Month => month_periods(request, calendar),
    };

    debug!(
        frequency = %request.frequency,
        calendar = calendar.name(),
        windows = windows.len(),
        "Generated periods"
    );
    Ok(windows)
}

/// Reject ranges the calendar cannot answer for, instead of reading them as
/// closed days.
pub fn check_coverage(
    request: &PeriodRequest,
    calendar: &dyn CalendarProvider,
) -> Result<(), ConfigError> {
    let (first, last) = (request.start.date(), request.effective_end().date());
    if calendar.covers(first, last) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "historical_range",
            format!(
                "{} calendar does not cover {} to {}",
                calendar.name(),
                first,
                last
            ),
        ))
    }
}

fn day_periods(request: &PeriodRequest, calendar: &dyn CalendarProvider) -> Vec<Window> {
    let eff_end = request.effective_end();
    let mut windows = Vec::new();

    for day in calendar.valid_days(request.start.date(), eff_end.date()) {
        let day_start = start_of_day(day);
        let boundary = day_start + Duration::days(1);
        let period_start = request.start.max(day_start);
        let period_end = eff_end.min(boundary);
        if period_start >= period_end {
            continue;
        }
        let period_end = if period_end == boundary {
            period_end - tick()
        } else {
            period_end
        };
        windows.extend(Window::new(period_start, period_end));
    }
    windows
}

fn intraday_periods(
    request: &PeriodRequest,
    calendar: &dyn CalendarProvider,
    interval: u32,
    open: NaiveTime,
    close: NaiveTime,
) -> Vec<Window> {
    let eff_end = request.effective_end();
    let step = Duration::minutes(interval.max(1) as i64);
    let mut windows = Vec::new();

    for day in calendar.valid_days(request.start.date(), request.end.date()) {
        let session_start = day.and_time(open).max(request.start);
        let session_end = day.and_time(close).min(eff_end);
        if session_start >= session_end {
            continue;
        }

        let mut current = session_start;
        while current < session_end {
            let next = current + step;
            let period_end = if next <= session_end {
                next - tick()
            } else {
                session_end
            };
            windows.extend(Window::new(current, period_end));
            current = next;
        }
    }
    windows
}

fn month_periods(request: &PeriodRequest, calendar: &dyn CalendarProvider) -> Vec<Window> {
    let eff_end = request.effective_end();
    let mut windows = Vec::new();

    let mut current = request.start;
    while current < eff_end {
        let next = start_of_day(first_of_next_month(current.date()));
        let period_end = if next <= eff_end { next - tick() } else { eff_end };

        let trading_days = calendar.valid_days(current.date(), period_end.date());
        if let (Some(&first), Some(&last)) = (trading_days.first(), trading_days.last()) {
            let actual_start = if current.date() == first {
                current
            } else {
                start_of_day(first)
            };
            let actual_end = period_end.min(end_of_day(last));
            windows.extend(Window::new(actual_start, actual_end));
        }
        current = next;
    }
    windows
}

/// The live window containing `now`: `[aligned, aligned + 1 unit)`.
pub fn live_window(now: NaiveDateTime, frequency: Frequency) -> Option<Window> {
    let aligned = frequency.align(now);
    Window::from_boundary(aligned, frequency.advance(aligned))
}
