use std::collections::BTreeMap;

use ulid::Ulid;

use crate::calendar;
use crate::model::*;

// ── Slot resolution ───────────────────────────────────────────────

/// Derive one viewer's slot status from a viewer-independent snapshot.
///
/// Precedence: Disabled dominates, then the active occupant, then —
/// only when the caller asked for cancellation history — the most
/// recent cancellation, then Available.
pub fn status_for_viewer(
    snap: &SlotSnapshot,
    viewer: Option<Ulid>,
    with_history: bool,
) -> HourSlotStatus {
    if snap.disabled {
        return HourSlotStatus::Disabled;
    }
    if let Some(occupant) = snap.active_requester {
        return if viewer == Some(occupant) {
            HourSlotStatus::BookedBySelf
        } else {
            HourSlotStatus::BookedByOther
        };
    }
    if with_history
        && let Some(actor) = snap.last_cancelled_by
    {
        return match actor {
            CancelActor::Fixer => HourSlotStatus::CancelledByFixer,
            CancelActor::Requester => HourSlotStatus::CancelledByRequester,
        };
    }
    HourSlotStatus::Available
}

// ── Day aggregation ───────────────────────────────────────────────

/// Aggregate a month from the precomputed per-day active counts plus
/// the template. O(days-in-month); never rescans appointment records.
pub fn day_statuses(
    template: &WeeklyTemplate,
    counts: &BTreeMap<u32, u32>,
    year: i32,
    month: u32,
) -> BTreeMap<u32, DayStatus> {
    let mut out = BTreeMap::new();
    for day in 1..=calendar::days_in_month(year, month) {
        let Some(date) = chrono::NaiveDate::from_ymd_opt(year, month, day) else {
            continue;
        };
        let capacity = template.capacity(date);
        let status = if capacity == 0 {
            DayStatus::Disabled
        } else {
            let booked = counts.get(&day).copied().unwrap_or(0);
            if booked == 0 {
                DayStatus::Available
            } else if booked >= capacity {
                DayStatus::Full
            } else {
                DayStatus::Partial
            }
        };
        out.insert(day, status);
    }
    out
}

/// The out-of-horizon (and degraded-backend) month result: every day
/// reported Disabled, never partial data.
pub fn disabled_month(year: i32, month: u32) -> BTreeMap<u32, DayStatus> {
    (1..=calendar::days_in_month(year, month))
        .map(|day| (day, DayStatus::Disabled))
        .collect()
}
