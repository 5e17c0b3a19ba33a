use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::time::timeout;
use ulid::Ulid;

use crate::calendar;
use crate::limits::LOCK_TIMEOUT;
use crate::model::*;
use crate::observability;

use super::availability::{day_statuses, disabled_month, status_for_viewer};
use super::validate::validate_hour;
use super::{Engine, EngineError};

impl Engine {
    pub async fn weekly_availability(&self, fixer_id: Ulid) -> Result<WeeklyTemplate, EngineError> {
        let fs = self
            .get_fixer(&fixer_id)
            .ok_or(EngineError::NotFound(fixer_id))?;
        let guard = timeout(LOCK_TIMEOUT, fs.read())
            .await
            .map_err(|_| EngineError::Unavailable("fixer state lock timed out".into()))?;
        Ok(guard.template.clone())
    }

    /// All appointment records (active and terminal) for one day.
    pub async fn appointments_for_date(
        &self,
        fixer_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Appointment>, EngineError> {
        let fs = self
            .get_fixer(&fixer_id)
            .ok_or(EngineError::NotFound(fixer_id))?;
        let guard = timeout(LOCK_TIMEOUT, fs.read())
            .await
            .map_err(|_| EngineError::Unavailable("fixer state lock timed out".into()))?;
        Ok(guard.appointments_for_date(date))
    }

    /// Active-appointment counts per day of `(year, month)` — the
    /// precomputed map the aggregator runs on.
    pub async fn monthly_booked_counts(
        &self,
        fixer_id: Ulid,
        year: i32,
        month: u32,
    ) -> Result<BTreeMap<u32, u32>, EngineError> {
        if !(1..=12).contains(&month) || !calendar::year_in_bounds(year) {
            return Err(EngineError::Validation("month outside the calendar"));
        }
        let fs = self
            .get_fixer(&fixer_id)
            .ok_or(EngineError::NotFound(fixer_id))?;
        let guard = timeout(LOCK_TIMEOUT, fs.read())
            .await
            .map_err(|_| EngineError::Unavailable("fixer state lock timed out".into()))?;
        Ok(guard.count_active_by_day(year, month))
    }

    /// Authoritative status of one hour slot for one viewer.
    ///
    /// `with_history = true` additionally surfaces the latest
    /// cancellation on an otherwise-free slot; for booking decisions a
    /// cancelled slot is simply Available.
    ///
    /// If the fixer's state cannot be read within the lock timeout this
    /// returns `Unknown` — a degraded slot is never reported bookable.
    pub async fn resolve_slot(
        &self,
        fixer_id: Ulid,
        date: NaiveDate,
        hour: u8,
        viewer: Option<Ulid>,
        with_history: bool,
    ) -> Result<HourSlotStatus, EngineError> {
        validate_hour(hour)?;
        let fs = self
            .get_fixer(&fixer_id)
            .ok_or(EngineError::NotFound(fixer_id))?;

        let snap = if let Some(cached) = self.cache.get_slot(fixer_id, date, hour) {
            cached
        } else {
            let Ok(guard) = timeout(LOCK_TIMEOUT, fs.read()).await else {
                metrics::counter!(observability::DEGRADED_READS_TOTAL, "query" => "slot")
                    .increment(1);
                tracing::warn!("resolve_slot degraded for fixer {fixer_id}: lock timeout");
                return Ok(HourSlotStatus::Unknown);
            };
            let snap = guard.slot_snapshot(date, hour);
            drop(guard);
            self.cache.put_slot(fixer_id, date, hour, snap);
            snap
        };

        Ok(status_for_viewer(&snap, viewer, with_history))
    }

    /// Per-day aggregate statuses for a calendar month, bounded to the
    /// forward horizon. Months entirely outside the horizon — and
    /// months whose state cannot be read in time — come back with every
    /// day Disabled rather than partial data.
    pub async fn aggregate_month(
        &self,
        fixer_id: Ulid,
        year: i32,
        month: u32,
    ) -> Result<BTreeMap<u32, DayStatus>, EngineError> {
        if !(1..=12).contains(&month) || !calendar::year_in_bounds(year) {
            return Err(EngineError::Validation("month outside the calendar"));
        }
        let fs = self
            .get_fixer(&fixer_id)
            .ok_or(EngineError::NotFound(fixer_id))?;

        if !calendar::month_in_horizon(year, month, calendar::today()) {
            return Ok(disabled_month(year, month));
        }

        if let Some(cached) = self.cache.get_month(fixer_id, year, month) {
            return Ok(cached.as_ref().clone());
        }

        let Ok(guard) = timeout(LOCK_TIMEOUT, fs.read()).await else {
            metrics::counter!(observability::DEGRADED_READS_TOTAL, "query" => "month")
                .increment(1);
            tracing::warn!("aggregate_month degraded for fixer {fixer_id}: lock timeout");
            return Ok(disabled_month(year, month));
        };
        let counts = guard.count_active_by_day(year, month);
        let days = day_statuses(&guard.template, &counts, year, month);
        drop(guard);

        let days = Arc::new(days);
        self.cache.put_month(fixer_id, year, month, days.clone());
        Ok(days.as_ref().clone())
    }
}
