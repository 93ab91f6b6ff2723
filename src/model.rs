use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calendar::TimeBlock;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// Implements `as_str`, `Display` and `FromStr` over the snake_case wire names.
macro_rules! status_names {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(UnknownName {
                        kind: stringify!($ty),
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct UnknownName {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    Urgent,
}

status_names!(Priority {
    Normal => "normal",
    Urgent => "urgent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    PendingConfirmation,
    Confirmed,
    Rejected,
}

status_names!(RequestStatus {
    PendingConfirmation => "pending_confirmation",
    Confirmed => "confirmed",
    Rejected => "rejected",
});

impl RequestStatus {
    /// Pending and confirmed requests hold their slot; rejected ones never do.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, RequestStatus::Rejected)
    }
}

/// Primary work-order axis. Declaration order is lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkOrderStatus {
    ScheduledDiagnosis,
    InProgress,
    InRepair,
    Finished,
}

status_names!(WorkOrderStatus {
    ScheduledDiagnosis => "scheduled_diagnosis",
    InProgress => "in_progress",
    InRepair => "in_repair",
    Finished => "finished",
});

/// Technical sign-off axis, orthogonal to [`WorkOrderStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosureStatus {
    Open,
    Closed,
}

status_names!(ClosureStatus {
    Open => "open",
    Closed => "closed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleStatus {
    Available,
    InUse,
}

status_names!(VehicleStatus {
    Available => "available",
    InUse => "in_use",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub label: Option<String>,
    pub status: VehicleStatus,
}

/// Optional tagging applied when a request is confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignments {
    pub employee_id: Option<Ulid>,
    pub bay: Option<String>,
    pub technician: Option<String>,
}

/// Technician sign-off recorded on closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signoff {
    pub technician: String,
    pub note: Option<String>,
}

/// Caller input for a new diagnostic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub requester_id: Ulid,
    pub date: NaiveDate,
    pub block: TimeBlock,
    pub category: String,
    pub priority: Priority,
    pub notes: Option<String>,
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRequest {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub requester_id: Ulid,
    pub category: String,
    pub priority: Priority,
    pub requested_date: NaiveDate,
    pub requested_block: TimeBlock,
    pub notes: Option<String>,
    pub attachments: Vec<String>,
    pub status: RequestStatus,
    pub confirmed_date: Option<NaiveDate>,
    pub confirmed_block: Option<TimeBlock>,
    pub work_order_id: Option<Ulid>,
    pub submitted_at: Ms,
    /// When the request left `pending_confirmation`.
    pub decided_at: Option<Ms>,
    pub rejection_reason: Option<String>,
}

impl DiagnosticRequest {
    pub fn submitted(new: NewRequest, at: Ms) -> Self {
        Self {
            id: new.id,
            vehicle_id: new.vehicle_id,
            requester_id: new.requester_id,
            category: new.category,
            priority: new.priority,
            requested_date: new.date,
            requested_block: new.block,
            notes: new.notes,
            attachments: new.attachments,
            status: RequestStatus::PendingConfirmation,
            confirmed_date: None,
            confirmed_block: None,
            work_order_id: None,
            submitted_at: at,
            decided_at: None,
            rejection_reason: None,
        }
    }

    /// The date this request is filed under: the confirmed date once
    /// confirmed, otherwise the requested date.
    pub fn home_date(&self) -> NaiveDate {
        self.confirmed_date.unwrap_or(self.requested_date)
    }

    /// Description carried over to the work order created on confirmation.
    pub fn work_description(&self) -> String {
        match &self.notes {
            Some(notes) => format!("{}: {}", self.category, notes),
            None => self.category.clone(),
        }
    }

    /// The `(date, block)` pair this request currently claims, if any.
    pub fn held_slot(&self) -> Option<(NaiveDate, TimeBlock)> {
        match self.status {
            RequestStatus::PendingConfirmation => Some((self.requested_date, self.requested_block)),
            RequestStatus::Confirmed => Some((
                self.confirmed_date.unwrap_or(self.requested_date),
                self.confirmed_block.unwrap_or(self.requested_block),
            )),
            RequestStatus::Rejected => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: Ulid,
    /// `None` for orders a coordinator created directly.
    pub request_id: Option<Ulid>,
    pub vehicle_id: Ulid,
    pub employee_id: Option<Ulid>,
    pub work_type: String,
    pub description: String,
    pub bay: Option<String>,
    pub technician: Option<String>,
    pub status: WorkOrderStatus,
    pub closure: ClosureStatus,
    pub created_at: Ms,
    /// Entered `in_progress`.
    pub started_at: Option<Ms>,
    /// Entered `in_repair`.
    pub repair_started_at: Option<Ms>,
    /// Entered `finished`.
    pub completed_at: Option<Ms>,
    pub closed_at: Option<Ms>,
    pub signoff: Option<Signoff>,
}

impl WorkOrder {
    pub fn scheduled(
        id: Ulid,
        request_id: Option<Ulid>,
        vehicle_id: Ulid,
        work_type: String,
        description: String,
        assignments: Assignments,
        at: Ms,
    ) -> Self {
        Self {
            id,
            request_id,
            vehicle_id,
            employee_id: assignments.employee_id,
            work_type,
            description,
            bay: assignments.bay,
            technician: assignments.technician,
            status: WorkOrderStatus::ScheduledDiagnosis,
            closure: ClosureStatus::Open,
            created_at: at,
            started_at: None,
            repair_started_at: None,
            completed_at: None,
            closed_at: None,
            signoff: None,
        }
    }
}

/// Every request filed under one date: pending and confirmed requests holding
/// a block that day, plus rejected ones last filed here. This is the
/// authoritative record; availability is derived from it on each read.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub requests: Vec<DiagnosticRequest>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            requests: Vec::new(),
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&DiagnosticRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    /// Remove a request by id.
    pub fn take(&mut self, id: Ulid) -> Option<DiagnosticRequest> {
        let pos = self.requests.iter().position(|r| r.id == id)?;
        Some(self.requests.remove(pos))
    }

    /// The active request holding `block` on this date, if any.
    pub fn holder_of(&self, block: TimeBlock) -> Option<&DiagnosticRequest> {
        self.requests
            .iter()
            .find(|r| r.held_slot() == Some((self.date, block)))
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        id: Ulid,
        label: Option<String>,
    },
    RequestSubmitted {
        id: Ulid,
        vehicle_id: Ulid,
        requester_id: Ulid,
        date: NaiveDate,
        block: TimeBlock,
        category: String,
        priority: Priority,
        notes: Option<String>,
        attachments: Vec<String>,
        at: Ms,
    },
    RequestConfirmed {
        id: Ulid,
        work_order_id: Ulid,
        work_type: String,
        date: NaiveDate,
        block: TimeBlock,
        assignments: Assignments,
        at: Ms,
    },
    RequestRejected {
        id: Ulid,
        reason: Option<String>,
        at: Ms,
    },
    WorkOrderCreated {
        id: Ulid,
        vehicle_id: Ulid,
        work_type: String,
        description: String,
        assignments: Assignments,
        at: Ms,
    },
    WorkOrderAdvanced {
        id: Ulid,
        to: WorkOrderStatus,
        at: Ms,
    },
    WorkOrderOverridden {
        id: Ulid,
        to: WorkOrderStatus,
        actor: String,
        reason: String,
        at: Ms,
    },
    WorkOrderClosed {
        id: Ulid,
        signoff: Signoff,
        at: Ms,
    },
}

// ── Outbound transitions ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Request,
    WorkOrder,
    Closure,
    Vehicle,
}

status_names!(EntityKind {
    Request => "request",
    WorkOrder => "work_order",
    Closure => "closure",
    Vehicle => "vehicle",
});

/// A status on any of the tracked axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusTag {
    Request(RequestStatus),
    WorkOrder(WorkOrderStatus),
    Closure(ClosureStatus),
    Vehicle(VehicleStatus),
}

impl StatusTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusTag::Request(s) => s.as_str(),
            StatusTag::WorkOrder(s) => s.as_str(),
            StatusTag::Closure(s) => s.as_str(),
            StatusTag::Vehicle(s) => s.as_str(),
        }
    }
}

impl fmt::Display for StatusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Normal,
    /// Administrative force-set, outside the normal lifecycle rules.
    Override { actor: String, reason: String },
}

/// One state change, as published to subscribers and kept in the transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub entity: EntityKind,
    pub id: Ulid,
    /// `None` when the entity was just created.
    pub from: Option<StatusTag>,
    pub to: StatusTag,
    pub at: Ms,
    pub kind: TransitionKind,
}

impl Transition {
    pub fn normal(entity: EntityKind, id: Ulid, from: Option<StatusTag>, to: StatusTag, at: Ms) -> Self {
        Self {
            entity,
            id,
            from,
            to,
            at,
            kind: TransitionKind::Normal,
        }
    }
}
