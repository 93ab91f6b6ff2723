mod availability;
mod booking;
mod error;
mod guard;
mod queries;
mod work_orders;

pub use availability::{available_blocks, available_dates, held_blocks};
pub use booking::ConfirmRequest;
pub use error::{EngineError, ValidationError};
pub use guard::today;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::calendar::{Schedule, TimeBlock};
use crate::lifecycle;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDay = Arc<RwLock<DayState>>;
pub type SharedWorkOrder = Arc<RwLock<WorkOrder>>;

/// How many times a confirmation is re-sent to the WAL after a storage error.
/// Safe because replaying a confirmation twice is a no-op.
const MAX_PERSIST_ATTEMPTS: usize = 3;

// ── Group-commit WAL channel ─────────────────────────────

struct WalAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Owns the WAL. Each wakeup takes the first pending append plus everything
/// already queued behind it, writes them all, then fsyncs once.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        metrics::gauge!(crate::observability::WAL_RECORDS).set(wal.records_appended() as f64);

        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[WalAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|append| wal.append_buffered(&append.event));
    // Flush even after a failed append so stale bytes don't ride along with
    // the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

// ── State transitions shared by live calls and replay ────

/// File a freshly submitted request under its date.
pub(super) fn submit_into(day: &mut DayState, request: DiagnosticRequest) -> Transition {
    let t = Transition::normal(
        EntityKind::Request,
        request.id,
        None,
        StatusTag::Request(RequestStatus::PendingConfirmation),
        request.submitted_at,
    );
    day.requests.push(request);
    t
}

/// Confirm request `id` filed in `from` onto `date`/`block`, refiling it in
/// `to` when the date changes. `None` if the request is not pending there.
#[allow(clippy::too_many_arguments)]
pub(super) fn confirm_in(
    from: &mut DayState,
    to: Option<&mut DayState>,
    id: Ulid,
    date: NaiveDate,
    block: TimeBlock,
    work_order_id: Ulid,
    at: Ms,
) -> Option<(DiagnosticRequest, Transition)> {
    if from.get(id)?.status != RequestStatus::PendingConfirmation {
        return None;
    }
    let mut request = from.take(id)?;
    request.status = RequestStatus::Confirmed;
    request.confirmed_date = Some(date);
    request.confirmed_block = Some(block);
    request.work_order_id = Some(work_order_id);
    request.decided_at = Some(at);
    let snapshot = request.clone();
    to.unwrap_or(from).requests.push(request);

    let t = Transition::normal(
        EntityKind::Request,
        id,
        Some(StatusTag::Request(RequestStatus::PendingConfirmation)),
        StatusTag::Request(RequestStatus::Confirmed),
        at,
    );
    Some((snapshot, t))
}

pub(super) fn reject_in(
    day: &mut DayState,
    id: Ulid,
    reason: Option<String>,
    at: Ms,
) -> Option<(DiagnosticRequest, Transition)> {
    let request = day.requests.iter_mut().find(|r| r.id == id)?;
    if request.status != RequestStatus::PendingConfirmation {
        return None;
    }
    request.status = RequestStatus::Rejected;
    request.decided_at = Some(at);
    request.rejection_reason = reason;

    let t = Transition::normal(
        EntityKind::Request,
        id,
        Some(StatusTag::Request(RequestStatus::PendingConfirmation)),
        StatusTag::Request(RequestStatus::Rejected),
        at,
    );
    Some((request.clone(), t))
}

/// Apply a lifecycle event to its work order. Returns the order's transition
/// and, for primary-axis moves, the vehicle status the new stage implies.
pub(super) fn progress(wo: &mut WorkOrder, event: &Event) -> Option<(Transition, Option<VehicleStatus>)> {
    match event {
        Event::WorkOrderAdvanced { to, at, .. } => Some((
            lifecycle::apply_advance(wo, *to, *at),
            lifecycle::vehicle_effect(*to),
        )),
        Event::WorkOrderOverridden { to, actor, reason, at, .. } => Some((
            lifecycle::apply_override(wo, *to, actor.clone(), reason.clone(), *at),
            lifecycle::vehicle_effect(*to),
        )),
        Event::WorkOrderClosed { signoff, at, .. } => {
            Some((lifecycle::apply_close(wo, signoff.clone(), *at), None))
        }
        _ => None,
    }
}

// ── Replay ───────────────────────────────────────────────

/// State rebuilt from the WAL into plain maps before it is shared.
#[derive(Default)]
struct Replay {
    days: HashMap<NaiveDate, DayState>,
    request_day: HashMap<Ulid, NaiveDate>,
    work_orders: HashMap<Ulid, WorkOrder>,
    vehicles: HashMap<Ulid, Vehicle>,
    transitions: HashMap<Ulid, Vec<Transition>>,
}

impl Replay {
    fn log(&mut self, t: Transition) {
        self.transitions.entry(t.id).or_default().push(t);
    }

    fn day(&mut self, date: NaiveDate) -> &mut DayState {
        self.days.entry(date).or_insert_with(|| DayState::new(date))
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::VehicleRegistered { id, label } => {
                if self.vehicles.contains_key(id) {
                    return;
                }
                self.vehicles.insert(
                    *id,
                    Vehicle {
                        id: *id,
                        label: label.clone(),
                        status: VehicleStatus::Available,
                    },
                );
            }
            Event::RequestSubmitted {
                id,
                vehicle_id,
                requester_id,
                date,
                block,
                category,
                priority,
                notes,
                attachments,
                at,
            } => {
                if self.request_day.contains_key(id) {
                    return;
                }
                let request = DiagnosticRequest::submitted(
                    NewRequest {
                        id: *id,
                        vehicle_id: *vehicle_id,
                        requester_id: *requester_id,
                        date: *date,
                        block: *block,
                        category: category.clone(),
                        priority: *priority,
                        notes: notes.clone(),
                        attachments: attachments.clone(),
                    },
                    *at,
                );
                let t = submit_into(self.day(*date), request);
                self.request_day.insert(*id, *date);
                self.log(t);
            }
            Event::RequestConfirmed {
                id,
                work_order_id,
                work_type,
                date,
                block,
                assignments,
                at,
            } => {
                let Some(from_date) = self.request_day.get(id).copied() else {
                    return;
                };
                let Some(mut from) = self.days.remove(&from_date) else {
                    return;
                };
                let confirmed = if from_date == *date {
                    confirm_in(&mut from, None, *id, *date, *block, *work_order_id, *at)
                } else {
                    let to = self.day(*date);
                    confirm_in(&mut from, Some(to), *id, *date, *block, *work_order_id, *at)
                };
                self.days.insert(from_date, from);

                // A duplicate record from a retried append finds the request
                // already confirmed and lands here.
                let Some((request, t)) = confirmed else { return };
                self.request_day.insert(*id, *date);
                self.log(t);
                let wo = WorkOrder::scheduled(
                    *work_order_id,
                    Some(*id),
                    request.vehicle_id,
                    work_type.clone(),
                    request.work_description(),
                    assignments.clone(),
                    *at,
                );
                self.log(lifecycle::created(wo.id, *at));
                self.work_orders.insert(wo.id, wo);
            }
            Event::RequestRejected { id, reason, at } => {
                let Some(date) = self.request_day.get(id).copied() else {
                    return;
                };
                if let Some((_, t)) = reject_in(self.day(date), *id, reason.clone(), *at) {
                    self.log(t);
                }
            }
            Event::WorkOrderCreated {
                id,
                vehicle_id,
                work_type,
                description,
                assignments,
                at,
            } => {
                if self.work_orders.contains_key(id) {
                    return;
                }
                let wo = WorkOrder::scheduled(
                    *id,
                    None,
                    *vehicle_id,
                    work_type.clone(),
                    description.clone(),
                    assignments.clone(),
                    *at,
                );
                self.log(lifecycle::created(*id, *at));
                self.work_orders.insert(*id, wo);
            }
            Event::WorkOrderAdvanced { id, at, .. }
            | Event::WorkOrderOverridden { id, at, .. }
            | Event::WorkOrderClosed { id, at, .. } => {
                let Some(wo) = self.work_orders.get_mut(id) else {
                    return;
                };
                let vehicle_id = wo.vehicle_id;
                let Some((t, effect)) = progress(wo, event) else {
                    return;
                };
                self.log(t);
                if let Some(to) = effect
                    && let Some(vehicle) = self.vehicles.get_mut(&vehicle_id)
                    && let Some(vt) = lifecycle::apply_vehicle_effect(vehicle, to, *at)
                {
                    self.log(vt);
                }
            }
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Authoritative in-memory state for one workshop.
///
/// Requests live in per-date [`DayState`]s, each behind its own lock, so a
/// capacity check and the write that claims the block happen under one
/// guard. Work orders are locked individually.
pub struct Engine {
    schedule: Arc<Schedule>,
    pub notify: Arc<NotifyHub>,
    wal_tx: mpsc::Sender<WalAppend>,
    days: DashMap<NaiveDate, SharedDay>,
    /// Reverse lookup: request id → the date it is filed under.
    request_day: DashMap<Ulid, NaiveDate>,
    work_orders: DashMap<Ulid, SharedWorkOrder>,
    vehicles: DashMap<Ulid, Vehicle>,
    /// Orders WAL records that carry a vehicle side effect, per vehicle, so
    /// replay applies them in the order they were applied live.
    vehicle_guards: DashMap<Ulid, Arc<Mutex<()>>>,
    transitions: DashMap<Ulid, Vec<Transition>>,
    /// Serializes creation of vehicles and standalone work orders.
    registry: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, schedule: Arc<Schedule>, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let mut replay = Replay::default();
        for event in &events {
            replay.apply(event);
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            schedule,
            notify,
            wal_tx,
            days: replay
                .days
                .into_iter()
                .map(|(date, day)| (date, Arc::new(RwLock::new(day))))
                .collect(),
            request_day: replay.request_day.into_iter().collect(),
            work_orders: replay
                .work_orders
                .into_iter()
                .map(|(id, wo)| (id, Arc::new(RwLock::new(wo))))
                .collect(),
            vehicles: replay.vehicles.into_iter().collect(),
            vehicle_guards: DashMap::new(),
            transitions: replay.transitions.into_iter().collect(),
            registry: Mutex::new(()),
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Write an event through the group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalAppend {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// `wal_append` with bounded retry, for events whose replay is idempotent.
    async fn wal_append_idempotent(&self, event: &Event) -> Result<(), EngineError> {
        let mut attempt = 1;
        loop {
            match self.wal_append(event).await {
                Err(EngineError::Persistence(msg)) if attempt < MAX_PERSIST_ATTEMPTS => {
                    warn!(attempt, "WAL append failed, retrying: {msg}");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Log, publish and count transitions that have just been applied.
    fn record(&self, transitions: impl IntoIterator<Item = Transition>, also: Option<Ulid>) {
        for t in transitions {
            metrics::counter!(
                crate::observability::TRANSITIONS_TOTAL,
                "entity" => t.entity.as_str(),
                "to" => t.to.as_str()
            )
            .increment(1);
            self.notify.send(&t, also);
            self.transitions.entry(t.id).or_default().push(t);
        }
    }

    fn day(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .clone()
    }

    fn existing_day(&self, date: NaiveDate) -> Option<SharedDay> {
        self.days.get(&date).map(|e| e.value().clone())
    }

    fn vehicle_guard(&self, id: Ulid) -> Arc<Mutex<()>> {
        self.vehicle_guards.entry(id).or_default().value().clone()
    }

    fn get_work_order_lock(&self, id: Ulid) -> Result<SharedWorkOrder, EngineError> {
        self.work_orders
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Write-lock `a` and, when different, `b`. Locks are taken in date order.
    async fn lock_days(
        &self,
        a: NaiveDate,
        b: NaiveDate,
    ) -> (OwnedRwLockWriteGuard<DayState>, Option<OwnedRwLockWriteGuard<DayState>>) {
        if a == b {
            return (self.day(a).write_owned().await, None);
        }
        if a < b {
            let first = self.day(a).write_owned().await;
            let second = self.day(b).write_owned().await;
            (first, Some(second))
        } else {
            let second = self.day(b).write_owned().await;
            let first = self.day(a).write_owned().await;
            (first, Some(second))
        }
    }

    /// Lock the day request `id` is filed under, plus `other` if given.
    ///
    /// A concurrent confirmation may refile the request between the lookup
    /// and the lock; then the lookup is retried against the new date.
    async fn resolve_request_write(
        &self,
        id: Ulid,
        other: Option<NaiveDate>,
    ) -> Result<(OwnedRwLockWriteGuard<DayState>, Option<OwnedRwLockWriteGuard<DayState>>), EngineError> {
        loop {
            let filed = self.filed_date(id)?;
            let (home, extra) = self.lock_days(filed, other.unwrap_or(filed)).await;
            if home.get(id).is_some() {
                return Ok((home, extra));
            }
            if self.filed_date(id)? == filed {
                // Reserved by a submission that has not committed.
                return Err(EngineError::NotFound(id));
            }
        }
    }

    fn filed_date(&self, id: Ulid) -> Result<NaiveDate, EngineError> {
        self.request_day
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))
    }
}
