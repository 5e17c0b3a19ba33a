mod availability;
mod cache;
mod error;
mod mutations;
mod queries;
mod validate;

pub use availability::{day_statuses, disabled_month, status_for_viewer};
pub use cache::RangeQueryCache;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedFixerState = Arc<RwLock<FixerState>>;

// ── WAL writer task ──────────────────────────────────────

/// Most ops the writer pulls per wakeup; one fsync covers them all.
const WAL_CHUNK: usize = 128;

pub(super) enum WalOp {
    Append {
        event: Event,
        done: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        done: oneshot::Sender<io::Result<()>>,
    },
    Backlog {
        done: oneshot::Sender<u64>,
    },
}

/// Sole owner of the WAL. Receives ops in chunks; consecutive appends
/// within a chunk share a single commit (group commit), and the
/// non-append ops act as barriers so the on-disk order matches the
/// order ops arrived in.
async fn wal_task(mut wal: Wal, mut rx: mpsc::Receiver<WalOp>) {
    let mut ops = Vec::with_capacity(WAL_CHUNK);
    loop {
        if rx.recv_many(&mut ops, WAL_CHUNK).await == 0 {
            return; // engine dropped
        }
        let mut waiting: Vec<oneshot::Sender<io::Result<()>>> = Vec::new();
        let mut buffered: io::Result<()> = Ok(());

        for op in ops.drain(..) {
            match op {
                WalOp::Append { event, done } => {
                    if buffered.is_ok() {
                        buffered = wal.buffer(&event);
                    }
                    waiting.push(done);
                }
                barrier => {
                    settle(&mut wal, &mut waiting, std::mem::replace(&mut buffered, Ok(())));
                    match barrier {
                        WalOp::Compact { events, done } => {
                            let result = Wal::write_compact_file(wal.path(), &events)
                                .and_then(|()| wal.swap_compact_file());
                            let _ = done.send(result);
                        }
                        WalOp::Backlog { done } => {
                            let _ = done.send(wal.appends_since_compact());
                        }
                        WalOp::Append { .. } => unreachable!(),
                    }
                }
            }
        }
        settle(&mut wal, &mut waiting, buffered);
    }
}

/// Commit everything buffered and answer the waiting appenders. One
/// failed buffer fails the whole group; the commit still runs so stray
/// buffered bytes never bleed into a later group.
fn settle(
    wal: &mut Wal,
    waiting: &mut Vec<oneshot::Sender<io::Result<()>>>,
    buffered: io::Result<()>,
) {
    if waiting.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(waiting.len() as f64);
    let started = std::time::Instant::now();
    let committed = wal.commit();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    let outcome = buffered.and(committed);
    for done in waiting.drain(..) {
        let _ = done.send(match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

// ── Engine ───────────────────────────────────────────────

/// The scheduling engine: every fixer's template and appointment book,
/// sharded behind per-fixer locks, durably backed by the WAL.
pub struct Engine {
    pub state: DashMap<Ulid, SharedFixerState>,
    pub(super) wal_tx: mpsc::Sender<WalOp>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: appointment id → fixer id.
    pub(super) appointment_index: DashMap<Ulid, Ulid>,
    pub cache: RangeQueryCache,
}

/// Mutate one fixer's state with an event. No locking here — every
/// caller already holds the fixer's write lock (or, during replay, is
/// the sole owner).
fn apply_to_fixer(fs: &mut FixerState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::TemplateReplaced { template, .. } => {
            fs.template = template.clone();
        }
        Event::AppointmentBooked { appointment } => {
            index.insert(appointment.id, appointment.fixer_id);
            fs.insert_appointment(appointment.clone());
        }
        Event::AppointmentTransitioned {
            id,
            state,
            cancelled_by,
            reason,
            at,
            ..
        } => {
            fs.apply_transition(id, *state, *cancelled_by, reason.clone(), *at);
        }
    }
}

impl Engine {
    /// Boot the engine: replay the log at `wal_path` into memory, then
    /// hand the reopened log to the background writer task. Must run
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_task(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            appointment_index: DashMap::new(),
            cache: RangeQueryCache::new(),
        };

        // Nobody else holds these Arcs yet, so try_write cannot fail.
        // blocking_write would panic here when boot happens on a
        // runtime thread.
        for event in &events {
            let fixer_id = event.fixer_id();
            if let Event::TemplateReplaced { .. } = event {
                engine.state.entry(fixer_id).or_insert_with(|| {
                    Arc::new(RwLock::new(FixerState::new(
                        fixer_id,
                        WeeklyTemplate::closed(),
                    )))
                });
            }
            if let Some(entry) = engine.state.get(&fixer_id) {
                let fs_arc = entry.clone();
                let mut guard = fs_arc.try_write().expect("replay: uncontended write");
                apply_to_fixer(&mut guard, event, &engine.appointment_index);
            }
        }

        metrics::gauge!(crate::observability::FIXERS_ACTIVE).set(engine.state.len() as f64);
        Ok(engine)
    }

    /// Hand an event to the group-commit writer and wait for it to hit
    /// disk. Any failure surfaces as `Unavailable` — the write did not
    /// happen.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (done, wait) = oneshot::channel();
        self.wal_tx
            .send(WalOp::Append {
                event: event.clone(),
                done,
            })
            .await
            .map_err(|_| EngineError::Unavailable("log writer is gone".into()))?;
        wait.await
            .map_err(|_| EngineError::Unavailable("log writer dropped the append".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub fn get_fixer(&self, id: &Ulid) -> Option<SharedFixerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn fixer_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_index
            .get(appointment_id)
            .map(|e| *e.value())
    }

    /// The standard write path: durable append, then in-memory apply,
    /// then fire-and-forget notification.
    pub(super) async fn persist_and_apply(
        &self,
        fixer_id: Ulid,
        fs: &mut FixerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_fixer(fs, event, &self.appointment_index);
        self.notify.send(fixer_id, event);
        Ok(())
    }

    /// Apply without appending — for the second half of a multi-event
    /// write whose appends were already committed.
    pub(super) fn apply_and_notify(&self, fixer_id: Ulid, fs: &mut FixerState, event: &Event) {
        apply_to_fixer(fs, event, &self.appointment_index);
        self.notify.send(fixer_id, event);
    }

    /// Bounded write-lock acquisition; no write blocks indefinitely on
    /// a wedged fixer.
    pub(super) async fn lock_fixer_write(
        &self,
        fs: &SharedFixerState,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<FixerState>, EngineError> {
        tokio::time::timeout(crate::limits::LOCK_TIMEOUT, fs.clone().write_owned())
            .await
            .map_err(|_| EngineError::Unavailable("fixer state lock timed out".into()))
    }

    /// Appointment id → its fixer's state, write-locked.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<FixerState>), EngineError> {
        let fixer_id = self
            .fixer_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let fs = self
            .get_fixer(&fixer_id)
            .ok_or(EngineError::NotFound(fixer_id))?;
        let guard = self.lock_fixer_write(&fs).await?;
        Ok((fixer_id, guard))
    }
}
