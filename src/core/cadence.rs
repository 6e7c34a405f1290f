//! Next-due computation for daily, weekly and monthly cadences.
//!
//! Everything here is pure: the caller supplies the reference instant and
//! the time zone the cadence's wall-clock times are interpreted in.

use chrono::{
    DateTime, Datelike, Days, Local, LocalResult, NaiveDate, NaiveDateTime, TimeDelta, TimeZone,
    Utc,
};
use serde::{Deserialize, Serialize};

use super::error::CadenceError;
use super::models::Cadence;

/// Months searched forward before giving up on a monthly cadence.
const MAX_MONTH_SEARCH: u32 = 12;

/// Zone in which cadence times of day are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleZone {
    #[default]
    Local,
    Utc,
}

impl ScheduleZone {
    /// Next due instant strictly after `after`, expressed in UTC.
    pub fn next_due(
        &self,
        cadence: &Cadence,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CadenceError> {
        match self {
            Self::Local => {
                next_due(cadence, &after.with_timezone(&Local)).map(|t| t.with_timezone(&Utc))
            }
            Self::Utc => next_due(cadence, &after),
        }
    }
}

/// Returns the earliest instant strictly after `after` that satisfies `cadence`.
pub fn next_due<Tz: TimeZone>(
    cadence: &Cadence,
    after: &DateTime<Tz>,
) -> Result<DateTime<Tz>, CadenceError> {
    cadence
        .validate()
        .map_err(|e| CadenceError::InvalidCadence(e.to_string()))?;

    let tz = after.timezone();
    let today = after.naive_local().date();
    let time = cadence.time().as_naive();

    let found = match cadence {
        Cadence::Daily { .. } => (0..=1)
            .filter_map(|offset| today.checked_add_days(Days::new(offset)))
            .filter_map(|date| resolve_local(&tz, date.and_time(time)))
            .find(|candidate| candidate > after),
        Cadence::Weekly { weekday, .. } => (0..=7)
            .filter_map(|offset| today.checked_add_days(Days::new(offset)))
            .filter(|date| date.weekday() == *weekday)
            .filter_map(|date| resolve_local(&tz, date.and_time(time)))
            .find(|candidate| candidate > after),
        Cadence::Monthly { day, .. } => (0..=MAX_MONTH_SEARCH)
            .filter_map(|offset| clamped_month_day(today, offset, u32::from(*day)))
            .filter_map(|date| resolve_local(&tz, date.and_time(time)))
            .find(|candidate| candidate > after),
    };

    found.ok_or_else(|| {
        CadenceError::InvalidCadence(format!("no {} occurrence found after reference", cadence.kind()))
    })
}

/// The `day`th day of the month `offset` months after `from`, clamped to that
/// month's last day.
fn clamped_month_day(from: NaiveDate, offset: u32, day: u32) -> Option<NaiveDate> {
    let months = from.year() * 12 + from.month0() as i32 + offset as i32;
    let year = months.div_euclid(12);
    let month = months.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month)?))
}

pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = first.checked_add_months(chrono::Months::new(1))?;
    Some(next.signed_duration_since(first).num_days() as u32)
}

/// Maps a wall-clock time onto `tz`. Ambiguous times (DST fall-back) take the
/// earlier instant; times inside a DST gap move forward by an hour.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest(),
    }
}
