use chrono::{Datelike, Days, Months, NaiveDate, Utc, Weekday};

use crate::limits::{HORIZON_MONTHS, MAX_VALID_YEAR, MIN_VALID_YEAR};
use crate::model::Ms;

/// Unix milliseconds — the only instant type.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Current civil date at the engine's canonical offset (UTC).
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Index into a weekly template: Monday = 0 … Sunday = 6.
pub fn weekday_index(weekday: Weekday) -> usize {
    weekday.num_days_from_monday() as usize
}

pub fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    first_of_month(year, month)
        .and_then(|d| d.checked_add_months(Months::new(1)))
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(0)
}

/// Last bookable date: `HORIZON_MONTHS` calendar months after `today`.
pub fn horizon_end(today: NaiveDate) -> NaiveDate {
    today
        .checked_add_months(Months::new(HORIZON_MONTHS))
        .unwrap_or(NaiveDate::MAX)
}

/// A date is bookable iff it lies in `[today, today + horizon]`.
pub fn date_in_horizon(date: NaiveDate, today: NaiveDate) -> bool {
    date >= today && date <= horizon_end(today)
}

/// A month is aggregatable iff any of its days overlaps the horizon
/// window. Months entirely in the past or past the horizon are out.
pub fn month_in_horizon(year: i32, month: u32, today: NaiveDate) -> bool {
    let Some(first) = first_of_month(year, month) else {
        return false;
    };
    let Some(last) = first
        .checked_add_months(Months::new(1))
        .and_then(|d| d.pred_opt())
    else {
        return false;
    };
    last >= today && first <= horizon_end(today)
}

pub fn year_in_bounds(year: i32) -> bool {
    (MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&year)
}

/// Next date strictly after `from` that falls on `weekday`.
pub fn next_on_weekday(from: NaiveDate, weekday: Weekday) -> NaiveDate {
    let mut d = from
        .checked_add_days(Days::new(1))
        .expect("date overflow");
    while d.weekday() != weekday {
        d = d.checked_add_days(Days::new(1)).expect("date overflow");
    }
    d
}
