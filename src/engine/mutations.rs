use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::calendar::{now_ms, today};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::validate::{
    check_slot_free, ensure_hour_enabled, validate_booking_date, validate_hour, validate_note,
    validate_reason,
};
use super::{Engine, EngineError, WalOp};

impl Engine {
    /// Replace a fixer's weekly template wholesale. The first call for
    /// an unknown fixer onboards it. Replacement is atomic: readers see
    /// either the old or the new template, never a mix.
    pub async fn set_availability(
        &self,
        fixer_id: Ulid,
        template: WeeklyTemplate,
    ) -> Result<(), EngineError> {
        let event = Event::TemplateReplaced {
            fixer_id,
            template,
        };

        let fs = match self.get_fixer(&fixer_id) {
            Some(fs) => fs,
            None => {
                if self.state.len() >= MAX_FIXERS {
                    return Err(EngineError::LimitExceeded("too many fixers"));
                }
                // Onboard with a closed template; the entry call keeps
                // a concurrent onboard of the same fixer from clobbering
                // this one's state.
                let fs = self
                    .state
                    .entry(fixer_id)
                    .or_insert_with(|| {
                        Arc::new(RwLock::new(FixerState::new(
                            fixer_id,
                            WeeklyTemplate::closed(),
                        )))
                    })
                    .clone();
                metrics::gauge!(observability::FIXERS_ACTIVE).set(self.state.len() as f64);
                fs
            }
        };

        let mut guard = self.lock_fixer_write(&fs).await?;
        self.persist_and_apply(fixer_id, &mut guard, &event).await?;
        drop(guard);

        // Every derived status for this fixer may have changed.
        self.cache.invalidate_fixer(fixer_id);
        Ok(())
    }

    /// Validate and atomically commit a new appointment. The
    /// check-then-insert runs under the fixer's write lock, so two
    /// concurrent calls for one slot produce exactly one appointment
    /// and one SlotConflict.
    pub async fn create_appointment(
        &self,
        id: Ulid,
        fixer_id: Ulid,
        requester_id: Ulid,
        date: NaiveDate,
        hour: u8,
        note: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_hour(hour)?;
        validate_note(&note)?;
        validate_booking_date(date, today())?;
        if self.appointment_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let fs = self
            .get_fixer(&fixer_id)
            .ok_or(EngineError::NotFound(fixer_id))?;
        let mut guard = self.lock_fixer_write(&fs).await?;

        ensure_hour_enabled(&guard.template, date, hour)?;
        if guard.slot_history_len(date, hour) >= MAX_SLOT_HISTORY {
            return Err(EngineError::LimitExceeded("slot history too long"));
        }
        if let Err(e) = check_slot_free(&guard, date, hour) {
            metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let now = now_ms();
        let appointment = Appointment {
            id,
            fixer_id,
            requester_id,
            date,
            hour,
            note,
            state: AppointmentState::Scheduled,
            cancelled_by: None,
            reason: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(fixer_id, &mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        self.cache.invalidate_slot(fixer_id, date, hour);
        self.cache
            .invalidate_month(fixer_id, date.year(), date.month());
        Ok(appointment)
    }

    /// Idempotent cancellation. Re-cancelling an already-cancelled
    /// appointment is a no-op success; cancelling a completed one is a
    /// validation error.
    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        actor: CancelActor,
        reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_reason(&reason)?;
        let (fixer_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let appointment = guard.get(&id).ok_or(EngineError::NotFound(id))?.clone();

        match appointment.state {
            AppointmentState::Cancelled => return Ok(appointment),
            AppointmentState::Completed => {
                return Err(EngineError::Validation("appointment already completed"));
            }
            AppointmentState::Scheduled => {}
        }

        let event = Event::AppointmentTransitioned {
            id,
            fixer_id,
            state: AppointmentState::Cancelled,
            cancelled_by: Some(actor),
            reason,
            at: now_ms(),
        };
        self.persist_and_apply(fixer_id, &mut guard, &event).await?;
        let updated = guard.get(&id).ok_or(EngineError::NotFound(id))?.clone();
        drop(guard);

        self.cache
            .invalidate_slot(fixer_id, appointment.date, appointment.hour);
        self.cache
            .invalidate_month(fixer_id, appointment.date.year(), appointment.date.month());
        Ok(updated)
    }

    /// Idempotent completion. Completing a cancelled appointment is a
    /// validation error.
    pub async fn complete_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let (fixer_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let appointment = guard.get(&id).ok_or(EngineError::NotFound(id))?.clone();

        match appointment.state {
            AppointmentState::Completed => return Ok(appointment),
            AppointmentState::Cancelled => {
                return Err(EngineError::Validation("appointment already cancelled"));
            }
            AppointmentState::Scheduled => {}
        }

        let event = Event::AppointmentTransitioned {
            id,
            fixer_id,
            state: AppointmentState::Completed,
            cancelled_by: None,
            reason: None,
            at: now_ms(),
        };
        self.persist_and_apply(fixer_id, &mut guard, &event).await?;
        let updated = guard.get(&id).ok_or(EngineError::NotFound(id))?.clone();
        drop(guard);

        self.cache
            .invalidate_slot(fixer_id, appointment.date, appointment.hour);
        self.cache
            .invalidate_month(fixer_id, appointment.date.year(), appointment.date.month());
        Ok(updated)
    }

    /// Move a booking: cancel the original (recording the reschedule
    /// reason) and book the new slot, both-or-neither. Everything is
    /// validated before the first append, and in-memory state is only
    /// touched after both appends succeed, so a failure leaves the
    /// original booking in place.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        new_date: NaiveDate,
        new_hour: u8,
        actor: CancelActor,
        reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_hour(new_hour)?;
        validate_reason(&reason)?;
        validate_booking_date(new_date, today())?;

        let (fixer_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let original = guard.get(&id).ok_or(EngineError::NotFound(id))?.clone();

        if original.state.is_terminal() {
            return Err(EngineError::Validation(
                "cannot reschedule a terminal appointment",
            ));
        }
        if (original.date, original.hour) == (new_date, new_hour) {
            return Err(EngineError::Validation("reschedule targets the same slot"));
        }
        ensure_hour_enabled(&guard.template, new_date, new_hour)?;
        if guard.slot_history_len(new_date, new_hour) >= MAX_SLOT_HISTORY {
            return Err(EngineError::LimitExceeded("slot history too long"));
        }
        if let Err(e) = check_slot_free(&guard, new_date, new_hour) {
            metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let now = now_ms();
        let cancel_event = Event::AppointmentTransitioned {
            id,
            fixer_id,
            state: AppointmentState::Cancelled,
            cancelled_by: Some(actor),
            reason: Some(reason.unwrap_or_else(|| "rescheduled".into())),
            at: now,
        };
        let replacement = Appointment {
            id: Ulid::new(),
            fixer_id,
            requester_id: original.requester_id,
            date: new_date,
            hour: new_hour,
            note: original.note.clone(),
            state: AppointmentState::Scheduled,
            cancelled_by: None,
            reason: None,
            created_at: now,
            updated_at: now,
        };
        let booked_event = Event::AppointmentBooked {
            appointment: replacement.clone(),
        };

        self.wal_append(&cancel_event).await?;
        if let Err(e) = self.wal_append(&booked_event).await {
            // The log now holds the cancellation alone. Append a
            // compensating re-activation so replay restores the
            // original booking; memory was never touched.
            let rollback = Event::AppointmentTransitioned {
                id,
                fixer_id,
                state: AppointmentState::Scheduled,
                cancelled_by: None,
                reason: None,
                at: now_ms(),
            };
            if let Err(rb) = self.wal_append(&rollback).await {
                tracing::error!("reschedule rollback append failed for {id}: {rb}");
            }
            return Err(e);
        }

        self.apply_and_notify(fixer_id, &mut guard, &cancel_event);
        self.apply_and_notify(fixer_id, &mut guard, &booked_event);
        drop(guard);

        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        for (date, hour) in [(original.date, original.hour), (new_date, new_hour)] {
            self.cache.invalidate_slot(fixer_id, date, hour);
            self.cache.invalidate_month(fixer_id, date.year(), date.month());
        }
        Ok(replacement)
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate current state: one template replace per fixer plus the
    /// full appointment book (records carry their final state, so the
    /// audit trail survives compaction).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let fixers: Vec<super::SharedFixerState> =
            self.state.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        for fs in fixers {
            let guard = fs.read().await;
            events.push(Event::TemplateReplaced {
                fixer_id: guard.id,
                template: guard.template.clone(),
            });
            for appointment in guard.all_appointments() {
                events.push(Event::AppointmentBooked {
                    appointment: appointment.clone(),
                });
            }
        }

        let (done, wait) = oneshot::channel();
        self.wal_tx
            .send(WalOp::Compact { events, done })
            .await
            .map_err(|_| EngineError::Unavailable("log writer is gone".into()))?;
        wait.await
            .map_err(|_| EngineError::Unavailable("log writer dropped the compaction".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (done, wait) = oneshot::channel();
        if self.wal_tx.send(WalOp::Backlog { done }).await.is_err() {
            return 0;
        }
        wait.await.unwrap_or(0)
    }
}
