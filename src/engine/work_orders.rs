use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use ulid::Ulid;

use crate::lifecycle::{self, Refused};
use crate::limits::*;
use crate::model::*;

use super::guard::{now_ms, validate_assignments, validate_description, validate_override, validate_signoff, validate_work_type};
use super::{progress, Engine, EngineError, ValidationError};

fn refused(entity: EntityKind, id: Ulid, r: Refused) -> EngineError {
    warn!(%id, from = %r.from, to = %r.to, "{entity} transition refused");
    EngineError::InvalidTransition {
        entity,
        id,
        from: r.from,
        to: r.to,
    }
}

impl Engine {
    /// Create a work order directly, without a diagnostic request.
    pub async fn create_work_order(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        work_type: String,
        description: String,
        assignments: Assignments,
    ) -> Result<WorkOrder, EngineError> {
        validate_work_type(&work_type)?;
        validate_description(&description)?;
        validate_assignments(&assignments)?;
        if !self.vehicles.contains_key(&vehicle_id) {
            return Err(ValidationError::UnknownVehicle(vehicle_id).into());
        }

        let _registry = self.registry.lock().await;
        if self.work_orders.len() >= MAX_WORK_ORDERS_PER_TENANT {
            return Err(ValidationError::LimitExceeded("too many work orders").into());
        }
        if self.work_orders.contains_key(&id) {
            return Err(ValidationError::AlreadyExists(id).into());
        }

        let at = now_ms();
        let event = Event::WorkOrderCreated {
            id,
            vehicle_id,
            work_type: work_type.clone(),
            description: description.clone(),
            assignments: assignments.clone(),
            at,
        };
        self.wal_append(&event).await?;
        let wo = WorkOrder::scheduled(id, None, vehicle_id, work_type, description, assignments, at);
        self.work_orders.insert(id, Arc::new(RwLock::new(wo.clone())));

        info!(%id, %vehicle_id, "work order created");
        self.record([lifecycle::created(id, at)], None);
        Ok(wo)
    }

    /// Move one step forward on the primary axis.
    pub async fn advance(&self, id: Ulid, target: WorkOrderStatus) -> Result<WorkOrder, EngineError> {
        let lock = self.get_work_order_lock(id)?;
        let mut wo = lock.write().await;
        lifecycle::check_advance(&wo, target).map_err(|r| refused(EntityKind::WorkOrder, id, r))?;

        let event = Event::WorkOrderAdvanced { id, to: target, at: now_ms() };
        self.commit_progress(&mut wo, &event).await
    }

    /// Technical sign-off. Only a `finished`, still open order can be closed.
    pub async fn close(&self, id: Ulid, signoff: Signoff) -> Result<WorkOrder, EngineError> {
        validate_signoff(&signoff)?;
        let lock = self.get_work_order_lock(id)?;
        let mut wo = lock.write().await;
        lifecycle::check_close(&wo).map_err(|r| refused(EntityKind::Closure, id, r))?;

        let event = Event::WorkOrderClosed { id, signoff, at: now_ms() };
        self.commit_progress(&mut wo, &event).await
    }

    /// Administrative override of the primary status. Skips the successor
    /// rule but still respects the closure validity table.
    pub async fn force_status(
        &self,
        id: Ulid,
        target: WorkOrderStatus,
        actor: String,
        reason: String,
    ) -> Result<WorkOrder, EngineError> {
        validate_override(&actor, &reason)?;
        let lock = self.get_work_order_lock(id)?;
        let mut wo = lock.write().await;
        lifecycle::check_override(&wo, target).map_err(|r| refused(EntityKind::WorkOrder, id, r))?;

        warn!(%id, from = %wo.status, to = %target, %actor, %reason, "work order status overridden");
        let event = Event::WorkOrderOverridden {
            id,
            to: target,
            actor,
            reason,
            at: now_ms(),
        };
        self.commit_progress(&mut wo, &event).await
    }

    /// Persist a lifecycle event, then apply it and its vehicle side effect.
    /// Caller holds the order's write lock; the vehicle guard is taken after it.
    async fn commit_progress(&self, wo: &mut WorkOrder, event: &Event) -> Result<WorkOrder, EngineError> {
        let guard = self.vehicle_guard(wo.vehicle_id);
        let _vehicle = guard.lock().await;
        self.wal_append(event).await?;
        let (t, effect) = progress(wo, event).ok_or(EngineError::NotFound(wo.id))?;
        info!(id = %wo.id, to = %t.to, "work order transition");

        let mut out = vec![t];
        if let Some(to) = effect
            && let Some(mut vehicle) = self.vehicles.get_mut(&wo.vehicle_id)
            && let Some(vt) = lifecycle::apply_vehicle_effect(&mut vehicle, to, out[0].at)
        {
            out.push(vt);
        }
        self.record(out, wo.request_id);
        Ok(wo.clone())
    }
}
