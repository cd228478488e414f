//! ISO week references and the arithmetic behind week navigation.
//!
//! The portal only shows a free-text label like `2025 week 13`; everything
//! here converts between that label, ISO week-date references and signed
//! week gaps. Gaps are computed by date subtraction, never `year * 52 +
//! week`, which misdates years with 53 ISO weeks.

use core::fmt;
use std::sync::LazyLock;

use chrono::{Datelike, Local, NaiveDate, Weekday};
use regex::Regex;

static WEEK_DISPLAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{4})\s+week\s+(\d{1,2})").unwrap());

static WEEK_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bweek\s*(\d{1,2})\b").unwrap());

/// An ISO-8601 week reference: weeks start Monday, week 1 is the week
/// containing the year's first Thursday.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WeekRef {
    pub year: i32,
    pub week: u32,
}

impl WeekRef {
    /// Returns `None` when `week` does not exist in `year` (week 53 of a
    /// 52-week year, week 0, week 54+).
    #[must_use]
    pub fn new(year: i32, week: u32) -> Option<Self> {
        let r = Self { year, week };
        r.monday().map(|_| r)
    }

    /// The reference containing `date`.
    #[must_use]
    pub fn of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    /// The reference containing today (local wall clock).
    #[must_use]
    pub fn now() -> Self {
        Self::of(Local::now().date_naive())
    }

    /// Monday of this week per ISO week-date rules.
    #[must_use]
    pub fn monday(self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)
    }

    /// Signed number of whole weeks from `self` to `target`. Positive means
    /// `target` lies in the future. `None` when either reference is invalid.
    #[must_use]
    pub fn weeks_until(self, target: Self) -> Option<i64> {
        let days = (target.monday()? - self.monday()?).num_days();
        // Monday-to-Monday distances are exact multiples of 7.
        Some(days / 7)
    }
}

impl fmt::Display for WeekRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} week {}", self.year, self.week)
    }
}

/// Parses a `<yyyy> week <w>` reference out of free display text,
/// case-insensitive, anywhere in the string. The result is validated
/// against the ISO calendar.
#[must_use]
pub fn parse_week_display(text: &str) -> Option<WeekRef> {
    let cap = WEEK_DISPLAY.captures(text)?;
    let year = cap[1].parse().ok()?;
    let week = cap[2].parse().ok()?;
    WeekRef::new(year, week)
}

/// Extracts a bare week-number hint ("week 37") from a trigger subject.
#[must_use]
pub fn parse_week_hint(text: &str) -> Option<u32> {
    let week: u32 = WEEK_HINT.captures(text)?[1].parse().ok()?;
    (1..=53).contains(&week).then_some(week)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monday_round_trips() {
        // 2015, 2020 and 2026 have 53 ISO weeks; the rest are ordinary.
        for year in [2015, 2019, 2020, 2024, 2025, 2026] {
            for week in 1..=53 {
                let Some(r) = WeekRef::new(year, week) else {
                    continue;
                };
                let monday = r.monday().unwrap();
                assert_eq!(WeekRef::of(monday), r);
            }
        }
    }

    #[test]
    fn week_53_only_exists_in_long_years() {
        assert!(WeekRef::new(2020, 53).is_some());
        assert!(WeekRef::new(2024, 53).is_none());
        assert!(WeekRef::new(2025, 0).is_none());
        assert!(WeekRef::new(2025, 54).is_none());
    }

    #[test]
    fn gap_is_zero_iff_equal() {
        let a = WeekRef::new(2025, 13).unwrap();
        let b = WeekRef::new(2025, 13).unwrap();
        let c = WeekRef::new(2025, 14).unwrap();
        assert_eq!(a.weeks_until(b), Some(0));
        assert_eq!(a.weeks_until(c), Some(1));
        assert_eq!(c.weeks_until(a), Some(-1));
    }

    #[test]
    fn gap_crosses_a_53_week_year() {
        // 2020-W52 .. 2021-W01 spans W53, so the gap is 2, not 1.
        let a = WeekRef::new(2020, 52).unwrap();
        let b = WeekRef::new(2021, 1).unwrap();
        assert_eq!(a.weeks_until(b), Some(2));
    }

    #[test]
    fn parses_display_text() {
        assert_eq!(
            parse_week_display("Rooster 2025 week 13"),
            WeekRef::new(2025, 13)
        );
        assert_eq!(
            parse_week_display("2025   WEEK   7 (maandoverzicht)"),
            WeekRef::new(2025, 7)
        );
        assert_eq!(parse_week_display("week 13"), None);
        assert_eq!(parse_week_display("loading..."), None);
        // Matches must survive ISO validation.
        assert_eq!(parse_week_display("2024 week 53"), None);
    }

    #[test]
    fn parses_subject_hints() {
        assert_eq!(parse_week_hint("Je rooster voor week 37 staat klaar"), Some(37));
        assert_eq!(parse_week_hint("Rooster update WEEK40"), Some(40));
        assert_eq!(parse_week_hint("Rooster update"), None);
        assert_eq!(parse_week_hint("week 99"), None);
    }
}
