use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::{IDEMPOTENCY_TTL, MAX_WIRE_LINE_LEN};
use crate::model::*;
use crate::observability;

/// One request per line, newline-delimited JSON, tagged by `op`.
/// Mutating commands accept an optional `request_id` idempotency key:
/// a replay inside the retention window returns the original response
/// without re-executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        password: String,
    },
    SetAvailability {
        fixer_id: Ulid,
        template: WeeklyTemplate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    GetAvailability {
        fixer_id: Ulid,
    },
    Book {
        fixer_id: Ulid,
        requester_id: Ulid,
        date: NaiveDate,
        hour: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Cancel {
        appointment_id: Ulid,
        actor: CancelActor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Complete {
        appointment_id: Ulid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Reschedule {
        appointment_id: Ulid,
        date: NaiveDate,
        hour: u8,
        actor: CancelActor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    ResolveSlot {
        fixer_id: Ulid,
        date: NaiveDate,
        hour: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer: Option<Ulid>,
        #[serde(default)]
        with_history: bool,
    },
    AggregateMonth {
        fixer_id: Ulid,
        year: i32,
        month: u32,
    },
    Appointments {
        fixer_id: Ulid,
        date: NaiveDate,
    },
    BookedCounts {
        fixer_id: Ulid,
        year: i32,
        month: u32,
    },
    Watch {
        fixer_id: Ulid,
    },
    Unwatch {
        fixer_id: Ulid,
    },
}

impl Request {
    fn request_id(&self) -> Option<&str> {
        match self {
            Request::SetAvailability { request_id, .. }
            | Request::Book { request_id, .. }
            | Request::Cancel { request_id, .. }
            | Request::Complete { request_id, .. }
            | Request::Reschedule { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// One response per line, tagged by `reply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Ready,
    AvailabilitySet {
        fixer_id: Ulid,
    },
    Availability {
        template: WeeklyTemplate,
    },
    Booked {
        appointment: Appointment,
    },
    Cancelled {
        appointment: Appointment,
    },
    Completed {
        appointment: Appointment,
    },
    Rescheduled {
        appointment: Appointment,
    },
    Slot {
        slot: HourSlotStatus,
    },
    Month {
        days: BTreeMap<u32, DayStatus>,
    },
    Counts {
        counts: BTreeMap<u32, u32>,
    },
    Appointments {
        appointments: Vec<Appointment>,
    },
    Watching {
        fixer_id: Ulid,
    },
    Unwatched {
        fixer_id: Ulid,
    },
    Notification {
        fixer_id: Ulid,
        event: Event,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Response {
    fn error(code: &str, message: impl std::fmt::Display) -> Self {
        Response::Error {
            code: code.into(),
            message: message.to_string(),
        }
    }

    fn status_label(&self) -> &'static str {
        match self {
            Response::Error { .. } => "error",
            _ => "ok",
        }
    }
}

fn engine_err(e: EngineError) -> Response {
    let code = match &e {
        EngineError::Validation(_) => "validation",
        EngineError::SlotConflict(_) => "conflict",
        EngineError::NotFound(_) => "not_found",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::LimitExceeded(_) => "limit",
        EngineError::Unavailable(_) => "unavailable",
    };
    Response::error(code, e)
}

fn encode(response: &Response) -> io::Result<String> {
    serde_json::to_string(response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line too long")
        }
        LinesCodecError::Io(e) => e,
    }
}

/// Replay cache for idempotency keys at the transport boundary: key →
/// the exact response line originally sent. Survives client retries of
/// mutating commands without re-executing them.
pub struct IdempotencyCache {
    entries: DashMap<String, (Instant, String)>,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|e| e.0.elapsed() < IDEMPOTENCY_TTL)
            .map(|e| e.1.clone())
    }

    pub fn put(&self, key: &str, line: String) {
        self.entries.insert(key.to_string(), (Instant::now(), line));
    }

    pub fn sweep_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (at, _)| at.elapsed() < IDEMPOTENCY_TTL);
        before - self.entries.len()
    }
}

async fn dispatch(engine: &Engine, req: Request) -> Response {
    match req {
        // Auth is handled before dispatch; a repeated hello is harmless.
        Request::Hello { .. } => Response::Ready,
        Request::SetAvailability {
            fixer_id, template, ..
        } => match engine.set_availability(fixer_id, template).await {
            Ok(()) => Response::AvailabilitySet { fixer_id },
            Err(e) => engine_err(e),
        },
        Request::GetAvailability { fixer_id } => {
            match engine.weekly_availability(fixer_id).await {
                Ok(template) => Response::Availability { template },
                Err(e) => engine_err(e),
            }
        }
        Request::Book {
            fixer_id,
            requester_id,
            date,
            hour,
            note,
            ..
        } => match engine
            .create_appointment(Ulid::new(), fixer_id, requester_id, date, hour, note)
            .await
        {
            Ok(appointment) => Response::Booked { appointment },
            Err(e) => engine_err(e),
        },
        Request::Cancel {
            appointment_id,
            actor,
            reason,
            ..
        } => match engine.cancel_appointment(appointment_id, actor, reason).await {
            Ok(appointment) => Response::Cancelled { appointment },
            Err(e) => engine_err(e),
        },
        Request::Complete { appointment_id, .. } => {
            match engine.complete_appointment(appointment_id).await {
                Ok(appointment) => Response::Completed { appointment },
                Err(e) => engine_err(e),
            }
        }
        Request::Reschedule {
            appointment_id,
            date,
            hour,
            actor,
            reason,
            ..
        } => match engine
            .reschedule_appointment(appointment_id, date, hour, actor, reason)
            .await
        {
            Ok(appointment) => Response::Rescheduled { appointment },
            Err(e) => engine_err(e),
        },
        Request::ResolveSlot {
            fixer_id,
            date,
            hour,
            viewer,
            with_history,
        } => match engine
            .resolve_slot(fixer_id, date, hour, viewer, with_history)
            .await
        {
            Ok(slot) => Response::Slot { slot },
            Err(e) => engine_err(e),
        },
        Request::AggregateMonth {
            fixer_id,
            year,
            month,
        } => match engine.aggregate_month(fixer_id, year, month).await {
            Ok(days) => Response::Month { days },
            Err(e) => engine_err(e),
        },
        Request::Appointments { fixer_id, date } => {
            match engine.appointments_for_date(fixer_id, date).await {
                Ok(appointments) => Response::Appointments { appointments },
                Err(e) => engine_err(e),
            }
        }
        Request::BookedCounts {
            fixer_id,
            year,
            month,
        } => match engine.monthly_booked_counts(fixer_id, year, month).await {
            Ok(counts) => Response::Counts { counts },
            Err(e) => engine_err(e),
        },
        // Watch/Unwatch carry connection-local state and are handled
        // by the connection loop before dispatch.
        Request::Watch { .. } | Request::Unwatch { .. } => {
            Response::error("protocol", "watch handled at connection level")
        }
    }
}

/// Serve one client connection: hello handshake, then a loop of
/// request lines interleaved with watch notifications.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    idempotency: Arc<IdempotencyCache>,
) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_WIRE_LINE_LEN));

    // First frame must be a matching hello.
    let Some(first) = framed.next().await else {
        return Ok(());
    };
    let first = first.map_err(codec_err)?;
    match serde_json::from_str::<Request>(&first) {
        Ok(Request::Hello { password: p }) if p == password => {
            framed
                .send(encode(&Response::Ready)?)
                .await
                .map_err(codec_err)?;
        }
        _ => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            framed
                .send(encode(&Response::error("auth", "bad or missing hello"))?)
                .await
                .map_err(codec_err)?;
            return Ok(());
        }
    }

    // Watch plumbing: one forwarder task per watched fixer, all fanned
    // into a single channel this loop drains.
    let (watch_tx, mut watch_rx) = mpsc::channel::<(Ulid, Event)>(256);
    let mut watchers: HashMap<Ulid, JoinHandle<()>> = HashMap::new();

    let result = loop {
        tokio::select! {
            maybe_line = framed.next() => {
                let Some(line) = maybe_line else { break Ok(()) };
                let line = match line {
                    Ok(l) => l,
                    Err(e) => break Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let req = match serde_json::from_str::<Request>(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        framed
                            .send(encode(&Response::error("protocol", e))?)
                            .await
                            .map_err(codec_err)?;
                        continue;
                    }
                };

                let op = observability::op_label(&req);
                let start = Instant::now();

                let out = match req {
                    Request::Watch { fixer_id } => {
                        let mut rx = engine.notify.subscribe(fixer_id);
                        let tx = watch_tx.clone();
                        let handle = tokio::spawn(async move {
                            loop {
                                match rx.recv().await {
                                    Ok(event) => {
                                        if tx.send((fixer_id, event)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                    Err(broadcast::error::RecvError::Closed) => break,
                                }
                            }
                        });
                        if let Some(old) = watchers.insert(fixer_id, handle) {
                            old.abort();
                        }
                        encode(&Response::Watching { fixer_id })?
                    }
                    Request::Unwatch { fixer_id } => {
                        if let Some(handle) = watchers.remove(&fixer_id) {
                            handle.abort();
                        }
                        encode(&Response::Unwatched { fixer_id })?
                    }
                    req => {
                        if let Some(key) = req.request_id()
                            && let Some(cached) = idempotency.get(key)
                        {
                            metrics::counter!(observability::IDEMPOTENT_REPLAYS_TOTAL)
                                .increment(1);
                            metrics::counter!(
                                observability::OPS_TOTAL,
                                "op" => op, "status" => "replay"
                            )
                            .increment(1);
                            framed.send(cached).await.map_err(codec_err)?;
                            continue;
                        }

                        let key = req.request_id().map(str::to_string);
                        let response = dispatch(&engine, req).await;
                        metrics::counter!(
                            observability::OPS_TOTAL,
                            "op" => op, "status" => response.status_label()
                        )
                        .increment(1);
                        metrics::histogram!(observability::OP_DURATION_SECONDS, "op" => op)
                            .record(start.elapsed().as_secs_f64());

                        let line = encode(&response)?;
                        if let Some(key) = key {
                            idempotency.put(&key, line.clone());
                        }
                        line
                    }
                };

                framed.send(out).await.map_err(codec_err)?;
            }
            maybe_event = watch_rx.recv() => {
                if let Some((fixer_id, event)) = maybe_event {
                    framed
                        .send(encode(&Response::Notification { fixer_id, event })?)
                        .await
                        .map_err(codec_err)?;
                }
            }
        }
    };

    for (_, handle) in watchers {
        handle.abort();
    }
    result
}
