use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::TimeBlock;
use crate::lifecycle;
use crate::limits::*;
use crate::model::*;

use super::guard::{
    check_slot_free, check_slot_shape, now_ms, today, validate_assignments, validate_label,
    validate_new_request, validate_work_type,
};
use super::{confirm_in, reject_in, submit_into, Engine, EngineError, ValidationError};

/// Coordinator input for [`Engine::confirm_request`]. The slot may differ
/// from the one originally requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub work_type: String,
    pub date: NaiveDate,
    pub block: TimeBlock,
    pub assignments: Assignments,
}

fn refused_request(id: Ulid, from: RequestStatus, to: RequestStatus) -> EngineError {
    warn!(%id, %from, %to, "request transition refused");
    EngineError::InvalidTransition {
        entity: EntityKind::Request,
        id,
        from: StatusTag::Request(from),
        to: StatusTag::Request(to),
    }
}

impl Engine {
    pub async fn register_vehicle(&self, id: Ulid, label: Option<String>) -> Result<Vehicle, EngineError> {
        validate_label(label.as_deref())?;
        let _registry = self.registry.lock().await;
        if self.vehicles.len() >= MAX_VEHICLES_PER_TENANT {
            return Err(ValidationError::LimitExceeded("too many vehicles").into());
        }
        if self.vehicles.contains_key(&id) {
            return Err(ValidationError::AlreadyExists(id).into());
        }

        let event = Event::VehicleRegistered { id, label: label.clone() };
        self.wal_append(&event).await?;
        let vehicle = Vehicle {
            id,
            label,
            status: VehicleStatus::Available,
        };
        self.vehicles.insert(id, vehicle.clone());
        self.record(
            [Transition::normal(
                EntityKind::Vehicle,
                id,
                None,
                StatusTag::Vehicle(VehicleStatus::Available),
                now_ms(),
            )],
            None,
        );
        Ok(vehicle)
    }

    /// File a new request in `pending_confirmation`.
    ///
    /// The block is re-checked under the day's write lock, so of two
    /// submissions racing for one slot exactly one commits and the other gets
    /// `CapacityConflict` with the day's remaining blocks.
    pub async fn submit_request(&self, new: NewRequest) -> Result<DiagnosticRequest, EngineError> {
        validate_new_request(&new)?;
        check_slot_shape(&self.schedule, new.date, new.block, today())?;
        if !self.vehicles.contains_key(&new.vehicle_id) {
            return Err(ValidationError::UnknownVehicle(new.vehicle_id).into());
        }
        if self.request_day.len() >= MAX_REQUESTS_PER_TENANT {
            return Err(ValidationError::LimitExceeded("too many requests").into());
        }

        // Reserve the id so a concurrent duplicate on another date fails fast.
        let id = new.id;
        match self.request_day.entry(id) {
            Entry::Occupied(_) => return Err(ValidationError::AlreadyExists(id).into()),
            Entry::Vacant(slot) => {
                slot.insert(new.date);
            }
        }

        let result = self.file_request(new).await;
        if result.is_err() {
            self.request_day.remove(&id);
        }
        result
    }

    async fn file_request(&self, new: NewRequest) -> Result<DiagnosticRequest, EngineError> {
        let day = self.day(new.date);
        let mut guard = day.write().await;
        check_slot_free(&self.schedule, &guard, new.block, None)?;

        let at = now_ms();
        let event = Event::RequestSubmitted {
            id: new.id,
            vehicle_id: new.vehicle_id,
            requester_id: new.requester_id,
            date: new.date,
            block: new.block,
            category: new.category.clone(),
            priority: new.priority,
            notes: new.notes.clone(),
            attachments: new.attachments.clone(),
            at,
        };
        self.wal_append(&event).await?;
        let request = DiagnosticRequest::submitted(new, at);
        let t = submit_into(&mut guard, request.clone());
        drop(guard);

        info!(id = %request.id, date = %request.requested_date, block = %request.requested_block, "request submitted");
        self.record([t], None);
        Ok(request)
    }

    /// Confirm a pending request and create its work order in one WAL record.
    ///
    /// Both the old and new day are locked for the duration, so the request
    /// never appears on neither or both. A second confirmation of the same
    /// request finds it already confirmed and fails with `InvalidTransition`.
    pub async fn confirm_request(
        &self,
        id: Ulid,
        confirm: ConfirmRequest,
    ) -> Result<(DiagnosticRequest, WorkOrder), EngineError> {
        validate_work_type(&confirm.work_type)?;
        validate_assignments(&confirm.assignments)?;
        check_slot_shape(&self.schedule, confirm.date, confirm.block, today())?;
        if self.work_orders.len() >= MAX_WORK_ORDERS_PER_TENANT {
            return Err(ValidationError::LimitExceeded("too many work orders").into());
        }

        let (mut from, mut to) = self.resolve_request_write(id, Some(confirm.date)).await?;
        let status = from.get(id).map(|r| r.status).ok_or(EngineError::NotFound(id))?;
        if status != RequestStatus::PendingConfirmation {
            return Err(refused_request(id, status, RequestStatus::Confirmed));
        }
        let target = to.as_deref().unwrap_or(&*from);
        check_slot_free(&self.schedule, target, confirm.block, Some(id))?;

        let at = now_ms();
        let work_order_id = Ulid::new();
        let event = Event::RequestConfirmed {
            id,
            work_order_id,
            work_type: confirm.work_type.clone(),
            date: confirm.date,
            block: confirm.block,
            assignments: confirm.assignments.clone(),
            at,
        };
        self.wal_append_idempotent(&event).await?;

        let (request, confirmed) = confirm_in(
            &mut from,
            to.as_deref_mut(),
            id,
            confirm.date,
            confirm.block,
            work_order_id,
            at,
        )
        .ok_or(EngineError::NotFound(id))?;
        self.request_day.insert(id, confirm.date);

        let wo = WorkOrder::scheduled(
            work_order_id,
            Some(id),
            request.vehicle_id,
            confirm.work_type,
            request.work_description(),
            confirm.assignments,
            at,
        );
        self.work_orders.insert(work_order_id, Arc::new(RwLock::new(wo.clone())));
        drop(to);
        drop(from);

        info!(%id, %work_order_id, date = %confirm.date, block = %confirm.block, "request confirmed");
        self.record([confirmed], None);
        self.record([lifecycle::created(work_order_id, at)], Some(id));
        Ok((request, wo))
    }

    /// Reject a pending request. Terminal; frees its block.
    pub async fn reject_request(&self, id: Ulid, reason: Option<String>) -> Result<DiagnosticRequest, EngineError> {
        if let Some(r) = &reason
            && r.len() > MAX_NOTES_LEN
        {
            return Err(ValidationError::LimitExceeded("reason").into());
        }
        let (mut day, _) = self.resolve_request_write(id, None).await?;
        let status = day.get(id).map(|r| r.status).ok_or(EngineError::NotFound(id))?;
        if status != RequestStatus::PendingConfirmation {
            return Err(refused_request(id, status, RequestStatus::Rejected));
        }

        let at = now_ms();
        let event = Event::RequestRejected {
            id,
            reason: reason.clone(),
            at,
        };
        self.wal_append(&event).await?;
        let (request, t) = reject_in(&mut day, id, reason, at).ok_or(EngineError::NotFound(id))?;
        drop(day);

        info!(%id, "request rejected");
        self.record([t], None);
        Ok(request)
    }
}
