//! Work-order state machine.
//!
//! Two orthogonal axes:
//!
//! ```text
//!   primary:  scheduled_diagnosis → in_progress → in_repair → finished
//!   closure:  open → closed
//! ```
//!
//! Validity table (closure × primary):
//!
//! | closure \ primary | scheduled_diagnosis | in_progress | in_repair | finished |
//! |-------------------|---------------------|-------------|-----------|----------|
//! | open              | valid               | valid       | valid     | valid    |
//! | closed            | invalid             | invalid     | invalid   | valid    |
//!
//! `advance` moves exactly one step forward. `close` requires `finished`.
//! `force` (administrative override) may jump anywhere on the primary axis but
//! never leaves the validity table.

use ulid::Ulid;

use crate::model::*;

/// A transition the rules refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refused {
    pub from: StatusTag,
    pub to: StatusTag,
}

pub fn successor(status: WorkOrderStatus) -> Option<WorkOrderStatus> {
    match status {
        WorkOrderStatus::ScheduledDiagnosis => Some(WorkOrderStatus::InProgress),
        WorkOrderStatus::InProgress => Some(WorkOrderStatus::InRepair),
        WorkOrderStatus::InRepair => Some(WorkOrderStatus::Finished),
        WorkOrderStatus::Finished => None,
    }
}

/// Vehicle status implied by entering `status`. Only an override can move an
/// order back to `scheduled_diagnosis`, and no stage is active there.
pub fn vehicle_effect(status: WorkOrderStatus) -> Option<VehicleStatus> {
    match status {
        WorkOrderStatus::ScheduledDiagnosis | WorkOrderStatus::Finished => Some(VehicleStatus::Available),
        WorkOrderStatus::InProgress | WorkOrderStatus::InRepair => Some(VehicleStatus::InUse),
    }
}

pub fn check_advance(wo: &WorkOrder, target: WorkOrderStatus) -> Result<(), Refused> {
    let refused = Refused {
        from: StatusTag::WorkOrder(wo.status),
        to: StatusTag::WorkOrder(target),
    };
    if wo.closure == ClosureStatus::Closed || successor(wo.status) != Some(target) {
        return Err(refused);
    }
    Ok(())
}

pub fn check_close(wo: &WorkOrder) -> Result<(), Refused> {
    if wo.status != WorkOrderStatus::Finished || wo.closure == ClosureStatus::Closed {
        return Err(Refused {
            from: StatusTag::WorkOrder(wo.status),
            to: StatusTag::Closure(ClosureStatus::Closed),
        });
    }
    Ok(())
}

pub fn check_override(wo: &WorkOrder, target: WorkOrderStatus) -> Result<(), Refused> {
    let refused = Refused {
        from: StatusTag::WorkOrder(wo.status),
        to: StatusTag::WorkOrder(target),
    };
    if target == wo.status {
        return Err(refused);
    }
    if wo.closure == ClosureStatus::Closed && target != WorkOrderStatus::Finished {
        return Err(refused);
    }
    Ok(())
}

/// Set `status`, stamping the stage it enters and clearing stamps of stages
/// beyond it.
fn enter(wo: &mut WorkOrder, status: WorkOrderStatus, at: Ms) {
    wo.status = status;
    let stamp = |reached: bool, slot: &mut Option<Ms>| {
        if !reached {
            *slot = None;
        } else if slot.is_none() {
            *slot = Some(at);
        }
    };
    stamp(status >= WorkOrderStatus::InProgress, &mut wo.started_at);
    stamp(status >= WorkOrderStatus::InRepair, &mut wo.repair_started_at);
    stamp(status >= WorkOrderStatus::Finished, &mut wo.completed_at);
}

pub fn apply_advance(wo: &mut WorkOrder, to: WorkOrderStatus, at: Ms) -> Transition {
    let from = wo.status;
    enter(wo, to, at);
    Transition::normal(
        EntityKind::WorkOrder,
        wo.id,
        Some(StatusTag::WorkOrder(from)),
        StatusTag::WorkOrder(to),
        at,
    )
}

pub fn apply_override(
    wo: &mut WorkOrder,
    to: WorkOrderStatus,
    actor: String,
    reason: String,
    at: Ms,
) -> Transition {
    let from = wo.status;
    enter(wo, to, at);
    Transition {
        entity: EntityKind::WorkOrder,
        id: wo.id,
        from: Some(StatusTag::WorkOrder(from)),
        to: StatusTag::WorkOrder(to),
        at,
        kind: TransitionKind::Override { actor, reason },
    }
}

pub fn apply_close(wo: &mut WorkOrder, signoff: Signoff, at: Ms) -> Transition {
    wo.closure = ClosureStatus::Closed;
    wo.closed_at = Some(at);
    wo.signoff = Some(signoff);
    Transition::normal(
        EntityKind::Closure,
        wo.id,
        Some(StatusTag::Closure(ClosureStatus::Open)),
        StatusTag::Closure(ClosureStatus::Closed),
        at,
    )
}

/// Apply a vehicle side effect, returning the transition if the status changed.
pub fn apply_vehicle_effect(vehicle: &mut Vehicle, to: VehicleStatus, at: Ms) -> Option<Transition> {
    if vehicle.status == to {
        return None;
    }
    let from = vehicle.status;
    vehicle.status = to;
    Some(Transition::normal(
        EntityKind::Vehicle,
        vehicle.id,
        Some(StatusTag::Vehicle(from)),
        StatusTag::Vehicle(to),
        at,
    ))
}

/// Creation transition for a freshly scheduled order.
pub fn created(id: Ulid, at: Ms) -> Transition {
    Transition::normal(
        EntityKind::WorkOrder,
        id,
        None,
        StatusTag::WorkOrder(WorkOrderStatus::ScheduledDiagnosis),
        at,
    )
}
