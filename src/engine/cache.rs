use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::{MONTH_CACHE_TTL, SLOT_CACHE_TTL};
use crate::model::{DayStatus, SlotSnapshot};
use crate::observability;

struct Cached<T> {
    value: T,
    inserted_at: Instant,
}

/// Short-lived cache of resolver/aggregator results, keyed per
/// (fixer, date, hour) and per (fixer, year, month). Entries are
/// removed — never mutated in place — on every write through the
/// coordinator; the TTL is only a backstop against missed
/// invalidations.
pub struct RangeQueryCache {
    slots: DashMap<(Ulid, NaiveDate, u8), Cached<SlotSnapshot>>,
    months: DashMap<(Ulid, i32, u32), Cached<Arc<BTreeMap<u32, DayStatus>>>>,
}

impl Default for RangeQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeQueryCache {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            months: DashMap::new(),
        }
    }

    pub fn get_slot(&self, fixer_id: Ulid, date: NaiveDate, hour: u8) -> Option<SlotSnapshot> {
        let hit = self
            .slots
            .get(&(fixer_id, date, hour))
            .filter(|e| e.inserted_at.elapsed() < SLOT_CACHE_TTL)
            .map(|e| e.value);
        record_lookup("slot", hit.is_some());
        hit
    }

    pub fn put_slot(&self, fixer_id: Ulid, date: NaiveDate, hour: u8, snap: SlotSnapshot) {
        self.slots.insert(
            (fixer_id, date, hour),
            Cached {
                value: snap,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn get_month(
        &self,
        fixer_id: Ulid,
        year: i32,
        month: u32,
    ) -> Option<Arc<BTreeMap<u32, DayStatus>>> {
        let hit = self
            .months
            .get(&(fixer_id, year, month))
            .filter(|e| e.inserted_at.elapsed() < MONTH_CACHE_TTL)
            .map(|e| e.value.clone());
        record_lookup("month", hit.is_some());
        hit
    }

    pub fn put_month(
        &self,
        fixer_id: Ulid,
        year: i32,
        month: u32,
        days: Arc<BTreeMap<u32, DayStatus>>,
    ) {
        self.months.insert(
            (fixer_id, year, month),
            Cached {
                value: days,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_slot(&self, fixer_id: Ulid, date: NaiveDate, hour: u8) {
        self.slots.remove(&(fixer_id, date, hour));
    }

    pub fn invalidate_month(&self, fixer_id: Ulid, year: i32, month: u32) {
        self.months.remove(&(fixer_id, year, month));
    }

    /// Drop everything cached for one fixer (template replacement
    /// changes every derived status at once).
    pub fn invalidate_fixer(&self, fixer_id: Ulid) {
        self.slots.retain(|(f, _, _), _| *f != fixer_id);
        self.months.retain(|(f, _, _), _| *f != fixer_id);
    }

    /// Evict expired entries. Called from the background sweep.
    pub fn sweep_expired(&self) -> usize {
        let before = self.slots.len() + self.months.len();
        self.slots
            .retain(|_, e| e.inserted_at.elapsed() < SLOT_CACHE_TTL);
        self.months
            .retain(|_, e| e.inserted_at.elapsed() < MONTH_CACHE_TTL);
        before - (self.slots.len() + self.months.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len() + self.months.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn record_lookup(kind: &'static str, hit: bool) {
    if hit {
        metrics::counter!(observability::CACHE_HITS_TOTAL, "kind" => kind).increment(1);
    } else {
        metrics::counter!(observability::CACHE_MISSES_TOTAL, "kind" => kind).increment(1);
    }
}
