//! Window Semantics
//!
//! A [`Window`] is the unit of work for both drivers. Windows are stored as
//! closed intervals at microsecond resolution: `end` is the last instant that
//! belongs to the window. This is equivalent to the half-open interval
//! `[start, end + 1µs)`, which is what every consumer observes through
//! [`Window::contains`] and [`Window::exclusive_end`].
//!
//! # Boundary Rule
//!
//! The period generator builds windows on natural boundaries (midnight, the
//! next N-minute slot, the first of the month) and subtracts one [`tick`] from the
//! boundary, so consecutive windows never touch:
//!
//! ```text
//! [2023-10-02 00:00:00.000000, 2023-10-02 23:59:59.999999]
//! [2023-10-03 00:00:00.000000, 2023-10-03 23:59:59.999999]
//! ```

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest representable step between two window boundaries.
#[inline]
pub fn tick() -> Duration {
    Duration::microseconds(1)
}

/// Compact minute-resolution stamp used in topics and archive names.
pub const COMPACT_FORMAT: &str = "%Y%m%dT%H%M";

/// Minute-resolution stamp used in redis output keys.
pub const KEY_FORMAT: &str = "%Y-%m-%d_%H:%M";

/// One unit of work: a time interval, closed at microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    /// First instant of the window (inclusive).
    pub start: NaiveDateTime,
    /// Last instant of the window (inclusive).
    pub end: NaiveDateTime,
}

impl Window {
    /// Build a window. Returns `None` unless `start < end`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Build a window from a natural half-open boundary `[start, boundary)`.
    pub fn from_boundary(start: NaiveDateTime, boundary: NaiveDateTime) -> Option<Self> {
        Self::new(start, boundary - tick())
    }

    /// First instant after the window.
    #[inline]
    pub fn exclusive_end(&self) -> NaiveDateTime {
        self.end + tick()
    }

    /// Half-open membership: `start <= t < exclusive_end()`.
    #[inline]
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        t >= self.start && t < self.exclusive_end()
    }

    /// Calendar date of the window start.
    #[inline]
    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }

    /// Time-of-day of the window start.
    #[inline]
    pub fn time(&self) -> NaiveTime {
        self.start.time()
    }

    /// Span covered by the window, measured against the exclusive end.
    pub fn duration(&self) -> Duration {
        self.exclusive_end() - self.start
    }

    /// `YYYYMMDDThhmm` stamp of the window start.
    pub fn compact_stamp(&self) -> String {
        self.start.format(COMPACT_FORMAT).to_string()
    }

    /// True when `self` ends strictly before `other` starts.
    pub fn precedes(&self, other: &Window) -> bool {
        self.end < other.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.start.format("%Y-%m-%dT%H:%M:%S%.6f"),
            self.end.format("%Y-%m-%dT%H:%M:%S%.6f")
        )
    }
}

/// Parse a compact `YYYYMMDDThhmm` stamp. Also accepts `YYYYMMDDThh:mm`,
/// which older publishers emitted.
pub fn parse_compact_stamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, COMPACT_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y%m%dT%H:%M"))
        .ok()
}

/// Midnight at the start of `date`.
pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

/// Last representable instant of `date` (23:59:59.999999).
pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_micro_opt(23, 59, 59, 999_999).unwrap_or_default()
}
