use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Slot address within one fixer's book: calendar day + hour index.
pub type SlotKey = (NaiveDate, u8);

/// The enabled hours of one weekday, stored as a 24-bit mask.
/// Serialized as a sorted list of hour indices (0–23).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct HourSet(u32);

impl HourSet {
    pub const EMPTY: Self = Self(0);

    pub fn from_hours(hours: &[u8]) -> Result<Self, InvalidHour> {
        let mut bits = 0u32;
        for &h in hours {
            if h > 23 {
                return Err(InvalidHour(h));
            }
            bits |= 1 << h;
        }
        Ok(Self(bits))
    }

    pub fn contains(&self, hour: u8) -> bool {
        hour <= 23 && self.0 & (1 << hour) != 0
    }

    /// Number of enabled hours — a weekday's booking capacity.
    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn hours(&self) -> impl Iterator<Item = u8> + '_ {
        (0u8..24).filter(|h| self.contains(*h))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidHour(pub u8);

impl std::fmt::Display for InvalidHour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hour {} outside 0..=23", self.0)
    }
}

impl TryFrom<Vec<u8>> for HourSet {
    type Error = InvalidHour;

    fn try_from(hours: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_hours(&hours)
    }
}

impl From<HourSet> for Vec<u8> {
    fn from(set: HourSet) -> Self {
        set.hours().collect()
    }
}

/// A fixer's recurring weekly availability: per weekday, the set of
/// hour slots that are ever bookable. Monday is index 0. An empty set
/// means the weekday is fully disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyTemplate {
    pub weekdays: [HourSet; 7],
}

impl WeeklyTemplate {
    /// All seven weekdays disabled.
    pub fn closed() -> Self {
        Self {
            weekdays: [HourSet::EMPTY; 7],
        }
    }

    pub fn enabled_hours(&self, date: NaiveDate) -> HourSet {
        self.weekdays[crate::calendar::weekday_index(date.weekday())]
    }

    pub fn weekday_disabled(&self, date: NaiveDate) -> bool {
        self.enabled_hours(date).is_empty()
    }

    /// Booking capacity of the weekday `date` falls on.
    pub fn capacity(&self, date: NaiveDate) -> u32 {
        self.enabled_hours(date).len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentState {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AppointmentState::Scheduled)
    }
}

/// Which party cancelled (or is cancelling) an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelActor {
    Fixer,
    Requester,
}

/// One scheduled hour of work. Never deleted — cancellations and
/// completions are state transitions on the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub fixer_id: Ulid,
    pub requester_id: Ulid,
    pub date: NaiveDate,
    pub hour: u8,
    pub note: Option<String>,
    pub state: AppointmentState,
    pub cancelled_by: Option<CancelActor>,
    pub reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    /// Only Scheduled appointments occupy a slot.
    pub fn is_active(&self) -> bool {
        matches!(self.state, AppointmentState::Scheduled)
    }
}

/// Authoritative status of one hour slot, as seen by one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HourSlotStatus {
    Available,
    BookedBySelf,
    BookedByOther,
    Disabled,
    CancelledByFixer,
    CancelledByRequester,
    /// Degraded backend — never reported as Available when state
    /// cannot be read in time.
    Unknown,
}

/// Aggregate status of one calendar day, for calendar-grid display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Available,
    Partial,
    Full,
    Disabled,
}

/// Viewer-independent state of one slot; the cacheable core from which
/// every viewer's `HourSlotStatus` is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub disabled: bool,
    pub active_requester: Option<Ulid>,
    pub last_cancelled_by: Option<CancelActor>,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TemplateReplaced {
        fixer_id: Ulid,
        template: WeeklyTemplate,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentTransitioned {
        id: Ulid,
        fixer_id: Ulid,
        state: AppointmentState,
        cancelled_by: Option<CancelActor>,
        reason: Option<String>,
        at: Ms,
    },
}

impl Event {
    pub fn fixer_id(&self) -> Ulid {
        match self {
            Event::TemplateReplaced { fixer_id, .. } => *fixer_id,
            Event::AppointmentBooked { appointment } => appointment.fixer_id,
            Event::AppointmentTransitioned { fixer_id, .. } => *fixer_id,
        }
    }
}

/// One fixer's full scheduling state: template, appointment book, and
/// the per-day active counters the aggregator reads.
#[derive(Debug, Clone)]
pub struct FixerState {
    pub id: Ulid,
    pub template: WeeklyTemplate,
    /// Every appointment ever recorded, per slot, in creation order.
    slots: BTreeMap<SlotKey, Vec<Appointment>>,
    /// Scheduled-appointment count per day, maintained on every
    /// mutation so monthly aggregation never rescans records.
    active_by_day: BTreeMap<NaiveDate, u32>,
    /// Appointment id → slot, for direct transition lookup.
    by_id: HashMap<Ulid, SlotKey>,
}

impl FixerState {
    pub fn new(id: Ulid, template: WeeklyTemplate) -> Self {
        Self {
            id,
            template,
            slots: BTreeMap::new(),
            active_by_day: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// The at-most-one active appointment occupying `(date, hour)`.
    pub fn find_active(&self, date: NaiveDate, hour: u8) -> Option<&Appointment> {
        self.slots
            .get(&(date, hour))
            .and_then(|history| history.iter().find(|a| a.is_active()))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        let key = self.by_id.get(id)?;
        self.slots.get(key)?.iter().find(|a| a.id == *id)
    }

    pub fn slot_history_len(&self, date: NaiveDate, hour: u8) -> usize {
        self.slots.get(&(date, hour)).map_or(0, Vec::len)
    }

    /// All records for one day (active and terminal), hour order.
    pub fn appointments_for_date(&self, date: NaiveDate) -> Vec<Appointment> {
        self.slots
            .range((date, 0)..=(date, 23))
            .flat_map(|(_, history)| history.iter().cloned())
            .collect()
    }

    /// Active-appointment counts per day-of-month for `(year, month)`.
    pub fn count_active_by_day(&self, year: i32, month: u32) -> BTreeMap<u32, u32> {
        let Some(first) = crate::calendar::first_of_month(year, month) else {
            return BTreeMap::new();
        };
        let days = crate::calendar::days_in_month(year, month);
        let Some(last) = NaiveDate::from_ymd_opt(year, month, days) else {
            return BTreeMap::new();
        };
        self.active_by_day
            .range(first..=last)
            .filter(|(_, count)| **count > 0)
            .map(|(date, count)| (date.day(), *count))
            .collect()
    }

    /// Record a new appointment. The caller has already checked the
    /// slot is free; this only maintains the indexes and counters.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let key = (appointment.date, appointment.hour);
        self.by_id.insert(appointment.id, key);
        if appointment.is_active() {
            *self.active_by_day.entry(appointment.date).or_insert(0) += 1;
        }
        self.slots.entry(key).or_default().push(appointment);
    }

    /// Apply a state transition, keeping the per-day counters honest.
    /// Unknown ids are ignored (replay of a compacted log).
    pub fn apply_transition(
        &mut self,
        id: &Ulid,
        state: AppointmentState,
        cancelled_by: Option<CancelActor>,
        reason: Option<String>,
        at: Ms,
    ) {
        let Some(&key) = self.by_id.get(id) else {
            return;
        };
        let Some(appointment) = self
            .slots
            .get_mut(&key)
            .and_then(|history| history.iter_mut().find(|a| a.id == *id))
        else {
            return;
        };

        let was_active = appointment.is_active();
        appointment.state = state;
        appointment.cancelled_by = cancelled_by;
        if reason.is_some() {
            appointment.reason = reason;
        }
        appointment.updated_at = at;

        let is_active = appointment.is_active();
        let date = key.0;
        if was_active && !is_active {
            if let Some(count) = self.active_by_day.get_mut(&date) {
                *count = count.saturating_sub(1);
            }
        } else if !was_active && is_active {
            *self.active_by_day.entry(date).or_insert(0) += 1;
        }
    }

    /// Viewer-independent snapshot of one slot: template gate, the
    /// active occupant, and the most recent cancellation (if any).
    pub fn slot_snapshot(&self, date: NaiveDate, hour: u8) -> SlotSnapshot {
        if !self.template.enabled_hours(date).contains(hour) {
            return SlotSnapshot {
                disabled: true,
                active_requester: None,
                last_cancelled_by: None,
            };
        }
        let history = self.slots.get(&(date, hour));
        let active_requester = history
            .and_then(|h| h.iter().find(|a| a.is_active()))
            .map(|a| a.requester_id);
        let last_cancelled_by = history.and_then(|h| {
            h.iter()
                .rev()
                .find(|a| matches!(a.state, AppointmentState::Cancelled))
                .and_then(|a| a.cancelled_by)
        });
        SlotSnapshot {
            disabled: false,
            active_requester,
            last_cancelled_by,
        }
    }

    /// Every appointment ever recorded, for WAL compaction.
    pub fn all_appointments(&self) -> impl Iterator<Item = &Appointment> {
        self.slots.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn business_hours() -> WeeklyTemplate {
        let day = HourSet::from_hours(&[9, 10, 11, 12, 14, 15, 16, 17]).unwrap();
        WeeklyTemplate {
            weekdays: [day, day, day, day, day, HourSet::EMPTY, HourSet::EMPTY],
        }
    }

    fn appointment(fixer: Ulid, requester: Ulid, d: NaiveDate, hour: u8) -> Appointment {
        Appointment {
            id: Ulid::new(),
            fixer_id: fixer,
            requester_id: requester,
            date: d,
            hour,
            note: None,
            state: AppointmentState::Scheduled,
            cancelled_by: None,
            reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn hour_set_basics() {
        let set = HourSet::from_hours(&[9, 10, 11, 12, 14, 15, 16, 17]).unwrap();
        assert_eq!(set.len(), 8);
        assert!(set.contains(9));
        assert!(!set.contains(13));
        assert!(!set.contains(23));
        assert_eq!(
            set.hours().collect::<Vec<_>>(),
            vec![9, 10, 11, 12, 14, 15, 16, 17]
        );
    }

    #[test]
    fn hour_set_rejects_out_of_range() {
        assert_eq!(HourSet::from_hours(&[9, 24]), Err(InvalidHour(24)));
    }

    #[test]
    fn hour_set_dedups() {
        let set = HourSet::from_hours(&[9, 9, 9]).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn hour_set_serde_roundtrip() {
        let set = HourSet::from_hours(&[0, 12, 23]).unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "[0,12,23]");
        let back: HourSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
        assert!(serde_json::from_str::<HourSet>("[25]").is_err());
    }

    #[test]
    fn template_weekday_lookup() {
        let template = business_hours();
        let monday = date(2026, 1, 5);
        let sunday = date(2026, 1, 4);
        assert!(!template.weekday_disabled(monday));
        assert_eq!(template.capacity(monday), 8);
        assert!(template.weekday_disabled(sunday));
        assert_eq!(template.capacity(sunday), 0);
    }

    #[test]
    fn find_active_skips_cancelled() {
        let fixer = Ulid::new();
        let mut fs = FixerState::new(fixer, business_hours());
        let monday = date(2026, 1, 5);

        let first = appointment(fixer, Ulid::new(), monday, 9);
        let first_id = first.id;
        fs.insert_appointment(first);
        fs.apply_transition(
            &first_id,
            AppointmentState::Cancelled,
            Some(CancelActor::Requester),
            None,
            1,
        );
        assert!(fs.find_active(monday, 9).is_none());

        let second = appointment(fixer, Ulid::new(), monday, 9);
        let second_id = second.id;
        fs.insert_appointment(second);
        assert_eq!(fs.find_active(monday, 9).unwrap().id, second_id);
        assert_eq!(fs.slot_history_len(monday, 9), 2);
    }

    #[test]
    fn active_counters_follow_transitions() {
        let fixer = Ulid::new();
        let mut fs = FixerState::new(fixer, business_hours());
        let monday = date(2026, 1, 5);

        let a = appointment(fixer, Ulid::new(), monday, 9);
        let b = appointment(fixer, Ulid::new(), monday, 10);
        let a_id = a.id;
        fs.insert_appointment(a);
        fs.insert_appointment(b);
        assert_eq!(fs.count_active_by_day(2026, 1), BTreeMap::from([(5, 2)]));

        fs.apply_transition(
            &a_id,
            AppointmentState::Cancelled,
            Some(CancelActor::Fixer),
            Some("sick".into()),
            1,
        );
        assert_eq!(fs.count_active_by_day(2026, 1), BTreeMap::from([(5, 1)]));

        // Reactivation (reschedule rollback) restores the count.
        fs.apply_transition(&a_id, AppointmentState::Scheduled, None, None, 2);
        assert_eq!(fs.count_active_by_day(2026, 1), BTreeMap::from([(5, 2)]));
    }

    #[test]
    fn count_active_by_day_is_month_scoped() {
        let fixer = Ulid::new();
        let mut fs = FixerState::new(fixer, business_hours());
        fs.insert_appointment(appointment(fixer, Ulid::new(), date(2026, 1, 30), 9));
        fs.insert_appointment(appointment(fixer, Ulid::new(), date(2026, 2, 2), 9));

        assert_eq!(fs.count_active_by_day(2026, 1), BTreeMap::from([(30, 1)]));
        assert_eq!(fs.count_active_by_day(2026, 2), BTreeMap::from([(2, 1)]));
    }

    #[test]
    fn appointments_for_date_includes_terminal_records() {
        let fixer = Ulid::new();
        let mut fs = FixerState::new(fixer, business_hours());
        let monday = date(2026, 1, 5);

        let a = appointment(fixer, Ulid::new(), monday, 9);
        let a_id = a.id;
        fs.insert_appointment(a);
        fs.insert_appointment(appointment(fixer, Ulid::new(), monday, 11));
        fs.apply_transition(
            &a_id,
            AppointmentState::Cancelled,
            Some(CancelActor::Requester),
            None,
            1,
        );

        let day = fs.appointments_for_date(monday);
        assert_eq!(day.len(), 2);
        assert_eq!(day[0].state, AppointmentState::Cancelled);
        assert_eq!(day[1].state, AppointmentState::Scheduled);
        assert!(fs.appointments_for_date(date(2026, 1, 6)).is_empty());
    }

    #[test]
    fn snapshot_reports_disabled_before_occupancy() {
        let fixer = Ulid::new();
        let mut fs = FixerState::new(fixer, business_hours());
        let sunday = date(2026, 1, 4);

        // Historical booking on a now-disabled day must not leak through.
        fs.insert_appointment(appointment(fixer, Ulid::new(), sunday, 9));
        let snap = fs.slot_snapshot(sunday, 9);
        assert!(snap.disabled);
        assert!(snap.active_requester.is_none());
    }

    #[test]
    fn snapshot_surfaces_latest_cancellation() {
        let fixer = Ulid::new();
        let mut fs = FixerState::new(fixer, business_hours());
        let monday = date(2026, 1, 5);

        let a = appointment(fixer, Ulid::new(), monday, 9);
        let a_id = a.id;
        fs.insert_appointment(a);
        fs.apply_transition(
            &a_id,
            AppointmentState::Cancelled,
            Some(CancelActor::Fixer),
            None,
            1,
        );
        let b = appointment(fixer, Ulid::new(), monday, 9);
        let b_id = b.id;
        fs.insert_appointment(b);
        fs.apply_transition(
            &b_id,
            AppointmentState::Cancelled,
            Some(CancelActor::Requester),
            None,
            2,
        );

        let snap = fs.slot_snapshot(monday, 9);
        assert!(!snap.disabled);
        assert!(snap.active_requester.is_none());
        assert_eq!(snap.last_cancelled_by, Some(CancelActor::Requester));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            appointment: appointment(Ulid::new(), Ulid::new(), date(2026, 3, 2), 14),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn event_fixer_id_extraction() {
        let fixer = Ulid::new();
        let event = Event::TemplateReplaced {
            fixer_id: fixer,
            template: WeeklyTemplate::closed(),
        };
        assert_eq!(event.fixer_id(), fixer);
    }
}
