use chrono::{Datelike, NaiveDate};

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_hour(hour: u8) -> Result<(), EngineError> {
    if hour > 23 {
        return Err(EngineError::Validation("hour outside 0..=23"));
    }
    Ok(())
}

/// Booking dates must be today or later, inside the horizon, and in
/// calendar-sanity bounds.
pub(crate) fn validate_booking_date(
    date: NaiveDate,
    today: NaiveDate,
) -> Result<(), EngineError> {
    if !calendar::year_in_bounds(date.year()) {
        return Err(EngineError::Validation("date outside supported years"));
    }
    if date < today {
        return Err(EngineError::Validation("date is in the past"));
    }
    if !calendar::date_in_horizon(date, today) {
        return Err(EngineError::Validation("date beyond the booking horizon"));
    }
    Ok(())
}

/// Disabled slots dominate everything: a weekday whose enabled set
/// omits `hour` can never be booked, regardless of appointment data.
pub(crate) fn ensure_hour_enabled(
    template: &WeeklyTemplate,
    date: NaiveDate,
    hour: u8,
) -> Result<(), EngineError> {
    if template.weekday_disabled(date) {
        return Err(EngineError::Validation("weekday is disabled"));
    }
    if !template.enabled_hours(date).contains(hour) {
        return Err(EngineError::Validation("hour not in the enabled set"));
    }
    Ok(())
}

/// The check half of check-then-insert. The caller holds the fixer's
/// write lock, which is what makes the pair atomic.
pub(crate) fn check_slot_free(
    fs: &FixerState,
    date: NaiveDate,
    hour: u8,
) -> Result<(), EngineError> {
    if let Some(existing) = fs.find_active(date, hour) {
        return Err(EngineError::SlotConflict(existing.id));
    }
    Ok(())
}

pub(crate) fn validate_note(note: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN
    {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(())
}

pub(crate) fn validate_reason(reason: &Option<String>) -> Result<(), EngineError> {
    if let Some(r) = reason
        && r.len() > MAX_REASON_LEN
    {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn weekday_template() -> WeeklyTemplate {
        let day = HourSet::from_hours(&[9, 10, 11]).unwrap();
        WeeklyTemplate {
            weekdays: [day, day, day, day, day, HourSet::EMPTY, HourSet::EMPTY],
        }
    }

    #[test]
    fn hour_bounds() {
        assert!(validate_hour(0).is_ok());
        assert!(validate_hour(23).is_ok());
        assert!(matches!(
            validate_hour(24),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn booking_date_window() {
        let today = date(2026, 2, 10);
        assert!(validate_booking_date(today, today).is_ok());
        assert!(validate_booking_date(date(2026, 8, 10), today).is_ok());
        assert!(matches!(
            validate_booking_date(date(2026, 2, 9), today),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_booking_date(date(2026, 8, 11), today),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_booking_date(date(1999, 12, 31), date(1999, 12, 1)),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn disabled_weekday_rejected_before_hour_check() {
        let template = weekday_template();
        let saturday = date(2026, 2, 14);
        assert!(matches!(
            ensure_hour_enabled(&template, saturday, 9),
            Err(EngineError::Validation("weekday is disabled"))
        ));
        let monday = date(2026, 2, 9);
        assert!(ensure_hour_enabled(&template, monday, 9).is_ok());
        assert!(matches!(
            ensure_hour_enabled(&template, monday, 13),
            Err(EngineError::Validation("hour not in the enabled set"))
        ));
    }

    #[test]
    fn occupied_slot_conflicts() {
        let fixer = Ulid::new();
        let mut fs = FixerState::new(fixer, weekday_template());
        let monday = date(2026, 2, 9);
        let occupant = Appointment {
            id: Ulid::new(),
            fixer_id: fixer,
            requester_id: Ulid::new(),
            date: monday,
            hour: 9,
            note: None,
            state: AppointmentState::Scheduled,
            cancelled_by: None,
            reason: None,
            created_at: 0,
            updated_at: 0,
        };
        let occupant_id = occupant.id;
        fs.insert_appointment(occupant);

        match check_slot_free(&fs, monday, 9) {
            Err(EngineError::SlotConflict(id)) => assert_eq!(id, occupant_id),
            other => panic!("expected SlotConflict, got {other:?}"),
        }
        assert!(check_slot_free(&fs, monday, 10).is_ok());
    }
}
