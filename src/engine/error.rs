use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::TimeBlock;
use crate::model::{EntityKind, StatusTag};

/// Malformed or unacceptable input. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("date {date} outside booking horizon {min}..={max}")]
    OutsideHorizon {
        date: NaiveDate,
        min: NaiveDate,
        max: NaiveDate,
    },
    #[error("{block} is not a bookable block on {date}")]
    NotInSchedule { date: NaiveDate, block: TimeBlock },
    #[error("unknown vehicle: {0}")]
    UnknownVehicle(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// The slot was taken before this call could commit. `available` is the
    /// refreshed list of free blocks on `date`.
    #[error("slot {date} {block} is already held; free blocks: [{}]", block_list(.available))]
    CapacityConflict {
        date: NaiveDate,
        block: TimeBlock,
        available: Vec<TimeBlock>,
    },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: EntityKind,
        id: Ulid,
        from: StatusTag,
        to: StatusTag,
    },
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::CapacityConflict { .. } => "capacity_conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Persistence(_) => "persistence",
        }
    }
}

fn block_list(blocks: &[TimeBlock]) -> String {
    blocks
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
