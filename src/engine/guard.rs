use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{Schedule, TimeBlock};
use crate::limits::*;
use crate::model::*;

use super::availability::available_blocks;
use super::{EngineError, ValidationError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

pub(crate) fn check_slot_shape(
    schedule: &Schedule,
    date: NaiveDate,
    block: TimeBlock,
    today: NaiveDate,
) -> Result<(), ValidationError> {
    if !schedule.in_horizon(date, today) {
        let (min, max) = schedule.horizon(today);
        return Err(ValidationError::OutsideHorizon { date, min, max });
    }
    if !schedule.has_block(date, block) {
        return Err(ValidationError::NotInSchedule { date, block });
    }
    Ok(())
}

/// Fail with `CapacityConflict` if an active request other than `ignoring`
/// already holds `block` on this day. Caller holds the day's write lock.
pub(crate) fn check_slot_free(
    schedule: &Schedule,
    day: &DayState,
    block: TimeBlock,
    ignoring: Option<Ulid>,
) -> Result<(), EngineError> {
    match day.holder_of(block) {
        Some(holder) if Some(holder.id) != ignoring => Err(EngineError::CapacityConflict {
            date: day.date,
            block,
            available: available_blocks(schedule, day.date, &day.requests),
        }),
        _ => Ok(()),
    }
}

fn check_text(value: &str, field: &'static str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.len() > max {
        return Err(ValidationError::LimitExceeded(field));
    }
    Ok(())
}

fn check_optional(value: Option<&str>, field: &'static str, max: usize) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.len() > max => Err(ValidationError::LimitExceeded(field)),
        _ => Ok(()),
    }
}

pub(crate) fn validate_new_request(new: &NewRequest) -> Result<(), ValidationError> {
    check_text(&new.category, "category", MAX_CATEGORY_LEN)?;
    check_optional(new.notes.as_deref(), "notes", MAX_NOTES_LEN)?;
    if new.attachments.len() > MAX_ATTACHMENTS {
        return Err(ValidationError::LimitExceeded("too many attachments"));
    }
    for reference in &new.attachments {
        check_text(reference, "attachment", MAX_ATTACHMENT_REF_LEN)?;
    }
    Ok(())
}

pub(crate) fn validate_assignments(a: &Assignments) -> Result<(), ValidationError> {
    check_optional(a.bay.as_deref(), "bay", MAX_LABEL_LEN)?;
    check_optional(a.technician.as_deref(), "technician", MAX_ACTOR_LEN)
}

pub(crate) fn validate_work_type(work_type: &str) -> Result<(), ValidationError> {
    check_text(work_type, "work_type", MAX_CATEGORY_LEN)
}

pub(crate) fn validate_description(description: &str) -> Result<(), ValidationError> {
    check_text(description, "description", MAX_DESCRIPTION_LEN)
}

pub(crate) fn validate_label(label: Option<&str>) -> Result<(), ValidationError> {
    check_optional(label, "label", MAX_LABEL_LEN)
}

pub(crate) fn validate_signoff(signoff: &Signoff) -> Result<(), ValidationError> {
    check_text(&signoff.technician, "technician", MAX_ACTOR_LEN)?;
    check_optional(signoff.note.as_deref(), "note", MAX_NOTES_LEN)
}

pub(crate) fn validate_override(actor: &str, reason: &str) -> Result<(), ValidationError> {
    check_text(actor, "actor", MAX_ACTOR_LEN)?;
    check_text(reason, "reason", MAX_NOTES_LEN)
}
