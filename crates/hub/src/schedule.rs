//! Schedule window evaluation.
//!
//! A window is open when the local day-of-week matches an entry, the local
//! hour is inside `[start_hour, end_hour)`, and no cycle has been claimed for
//! that entry on today's date yet.  Everything here is pure: the caller
//! supplies the configured entries and the set of ids already claimed today.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime, UtcOffset};

use crate::protocol::Durations;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: i64,
    /// 0 = Sunday .. 6 = Saturday.
    pub day: u8,
    pub start_hour: u8,
    /// Exclusive.
    pub end_hour: u8,
    pub durations: Durations,
}

impl ScheduleEntry {
    pub fn covers(&self, day: u8, hour: u8) -> bool {
        self.day == day && self.start_hour <= hour && hour < self.end_hour
    }
}

/// An open window that has not fired yet today.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWindow {
    pub schedule_id: i64,
    pub date: Date,
    pub durations: Durations,
}

pub fn day_of_week(now: OffsetDateTime) -> u8 {
    now.weekday().number_days_from_sunday()
}

/// `YYYY-MM-DD`, the per-day half of the cycle de-duplication key.
pub fn date_key(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month() as u8,
        date.day()
    )
}

/// First entry (in configured order) whose window is open at `now` and has
/// not been claimed today.
pub fn find_active_window(
    now: OffsetDateTime,
    entries: &[ScheduleEntry],
    claimed_today: &HashSet<i64>,
) -> Option<ActiveWindow> {
    let day = day_of_week(now);
    let hour = now.hour();

    entries
        .iter()
        .find(|e| e.covers(day, hour) && !claimed_today.contains(&e.id))
        .map(|e| ActiveWindow {
            schedule_id: e.id,
            date: now.date(),
            durations: e.durations,
        })
}

// ---------------------------------------------------------------------------
// Local wall clock
// ---------------------------------------------------------------------------

/// Summer-time rule applied on top of the standard offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DstRule {
    /// Second Sunday of March 02:00 local to first Sunday of November 02:00 local.
    Us,
    /// Last Sunday of March 01:00 UTC to last Sunday of October 01:00 UTC.
    Eu,
}

impl DstRule {
    /// UTC instants `[start, end)` during which summer time is in force.
    fn window(self, year: i32, standard: UtcOffset) -> Option<(OffsetDateTime, OffsetDateTime)> {
        match self {
            DstRule::Us => {
                let start = sunday_on_or_after(Date::from_calendar_date(year, Month::March, 8).ok()?);
                let end = sunday_on_or_after(Date::from_calendar_date(year, Month::November, 1).ok()?);
                let std = Duration::seconds(i64::from(standard.whole_seconds()));
                Some((
                    at_utc_hour(start, 2) - std,
                    at_utc_hour(end, 2) - std - Duration::HOUR,
                ))
            }
            DstRule::Eu => {
                let start = last_sunday(Date::from_calendar_date(year, Month::March, 31).ok()?);
                let end = last_sunday(Date::from_calendar_date(year, Month::October, 31).ok()?);
                Some((at_utc_hour(start, 1), at_utc_hour(end, 1)))
            }
        }
    }
}

fn sunday_on_or_after(date: Date) -> Date {
    let skip = (7 - date.weekday().number_days_from_sunday()) % 7;
    date + Duration::days(i64::from(skip))
}

fn last_sunday(month_end: Date) -> Date {
    month_end - Duration::days(i64::from(month_end.weekday().number_days_from_sunday()))
}

fn at_utc_hour(date: Date, hour: i64) -> OffsetDateTime {
    date.midnight().assume_utc() + Duration::hours(hour)
}

/// The garden's wall clock: a standard UTC offset plus an optional
/// summer-time rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalClock {
    standard: UtcOffset,
    dst: Option<DstRule>,
}

impl LocalClock {
    pub fn new(standard: UtcOffset, dst: Option<DstRule>) -> Self {
        Self { standard, dst }
    }

    /// Offset in force at the instant `t`.
    pub fn offset_at(&self, t: OffsetDateTime) -> UtcOffset {
        let year = t.to_offset(UtcOffset::UTC).year();
        let summer = self
            .dst
            .and_then(|rule| rule.window(year, self.standard))
            .is_some_and(|(start, end)| start <= t && t < end);
        if !summer {
            return self.standard;
        }
        UtcOffset::from_whole_seconds(self.standard.whole_seconds() + 3600)
            .unwrap_or(self.standard)
    }

    /// `t` expressed in local wall-clock time.
    pub fn local(&self, t: OffsetDateTime) -> OffsetDateTime {
        t.to_offset(self.offset_at(t))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
