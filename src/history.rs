//! Milestone timeline for one request and its work order, for display to the
//! requester. Pure projection over the records; nothing here mutates.

use serde::{Deserialize, Serialize};

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    Submitted,
    PendingConfirmation,
    Confirmed,
    /// Only present on rejected requests, in place of everything after it.
    Rejected,
    DiagnosisScheduled,
    RepairInProgress,
    Finished,
    Closed,
}

impl Milestone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Milestone::Submitted => "request_submitted",
            Milestone::PendingConfirmation => "pending_confirmation",
            Milestone::Confirmed => "confirmed",
            Milestone::Rejected => "rejected",
            Milestone::DiagnosisScheduled => "diagnosis_scheduled",
            Milestone::RepairInProgress => "repair_in_progress",
            Milestone::Finished => "finished",
            Milestone::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Current,
    Complete,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::Current => "current",
            MilestoneStatus::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub milestone: Milestone,
    pub at: Option<Ms>,
    pub status: MilestoneStatus,
}

/// Build the timeline. `work_order` is `None` before confirmation.
pub fn project_timeline(request: &DiagnosticRequest, work_order: Option<&WorkOrder>) -> Vec<TimelineEntry> {
    let mut reached: Vec<(Milestone, Option<Ms>)> = vec![
        (Milestone::Submitted, Some(request.submitted_at)),
        (Milestone::PendingConfirmation, Some(request.submitted_at)),
    ];

    if request.status == RequestStatus::Rejected {
        reached.push((Milestone::Rejected, request.decided_at));
    } else {
        let confirmed_at = match request.status {
            RequestStatus::Confirmed => request.decided_at,
            _ => None,
        };
        reached.push((Milestone::Confirmed, confirmed_at));
        reached.push((Milestone::DiagnosisScheduled, work_order.map(|wo| wo.created_at)));
        reached.push((
            Milestone::RepairInProgress,
            work_order.and_then(|wo| wo.started_at.or(wo.repair_started_at)),
        ));
        reached.push((Milestone::Finished, work_order.and_then(|wo| wo.completed_at)));
        reached.push((Milestone::Closed, work_order.and_then(|wo| wo.closed_at)));
    }

    let current = reached.iter().rposition(|(_, at)| at.is_some());

    reached
        .into_iter()
        .enumerate()
        .map(|(i, (milestone, at))| {
            let status = match current {
                Some(c) if i < c => MilestoneStatus::Complete,
                Some(c) if i == c => MilestoneStatus::Current,
                _ => MilestoneStatus::Pending,
            };
            TimelineEntry { milestone, at, status }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use ulid::Ulid;

    use super::*;
    use crate::calendar::TimeBlock;
    use crate::lifecycle;

    fn request() -> DiagnosticRequest {
        DiagnosticRequest::submitted(
            NewRequest {
                id: Ulid::new(),
                vehicle_id: Ulid::new(),
                requester_id: Ulid::new(),
                date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
                block: TimeBlock::new(480, 600),
                category: "electrical".into(),
                priority: Priority::Urgent,
                notes: Some("dash lights flicker".into()),
                attachments: vec![],
            },
            1_000,
        )
    }

    fn confirm(req: &mut DiagnosticRequest, at: Ms) -> WorkOrder {
        let wo = WorkOrder::scheduled(
            Ulid::new(),
            Some(req.id),
            req.vehicle_id,
            "diagnosis".into(),
            req.category.clone(),
            Assignments::default(),
            at,
        );
        req.status = RequestStatus::Confirmed;
        req.decided_at = Some(at);
        req.work_order_id = Some(wo.id);
        wo
    }

    fn statuses(timeline: &[TimelineEntry]) -> Vec<(Milestone, MilestoneStatus)> {
        timeline.iter().map(|e| (e.milestone, e.status)).collect()
    }

    #[test]
    fn pending_request_without_work_order() {
        let req = request();
        let tl = project_timeline(&req, None);
        assert_eq!(
            statuses(&tl),
            vec![
                (Milestone::Submitted, MilestoneStatus::Complete),
                (Milestone::PendingConfirmation, MilestoneStatus::Current),
                (Milestone::Confirmed, MilestoneStatus::Pending),
                (Milestone::DiagnosisScheduled, MilestoneStatus::Pending),
                (Milestone::RepairInProgress, MilestoneStatus::Pending),
                (Milestone::Finished, MilestoneStatus::Pending),
                (Milestone::Closed, MilestoneStatus::Pending),
            ]
        );
        assert!(tl[2..].iter().all(|e| e.at.is_none()));
    }

    #[test]
    fn confirmed_request_marks_diagnosis_scheduled_current() {
        let mut req = request();
        let wo = confirm(&mut req, 2_000);
        let tl = project_timeline(&req, Some(&wo));
        assert_eq!(tl[2].status, MilestoneStatus::Complete);
        assert_eq!(tl[2].at, Some(2_000));
        assert_eq!(tl[3].milestone, Milestone::DiagnosisScheduled);
        assert_eq!(tl[3].status, MilestoneStatus::Current);
        assert_eq!(tl[4].status, MilestoneStatus::Pending);
    }

    #[test]
    fn in_repair_counts_as_repair_in_progress() {
        let mut req = request();
        let mut wo = confirm(&mut req, 2_000);
        lifecycle::apply_advance(&mut wo, WorkOrderStatus::InProgress, 3_000);
        lifecycle::apply_advance(&mut wo, WorkOrderStatus::InRepair, 4_000);
        let tl = project_timeline(&req, Some(&wo));
        assert_eq!(tl[4].milestone, Milestone::RepairInProgress);
        assert_eq!(tl[4].at, Some(3_000));
        assert_eq!(tl[4].status, MilestoneStatus::Current);
    }

    #[test]
    fn closed_order_has_everything_complete_but_last() {
        let mut req = request();
        let mut wo = confirm(&mut req, 2_000);
        lifecycle::apply_advance(&mut wo, WorkOrderStatus::InProgress, 3_000);
        lifecycle::apply_advance(&mut wo, WorkOrderStatus::InRepair, 4_000);
        lifecycle::apply_advance(&mut wo, WorkOrderStatus::Finished, 5_000);
        lifecycle::apply_close(
            &mut wo,
            Signoff {
                technician: "t".into(),
                note: None,
            },
            6_000,
        );
        let tl = project_timeline(&req, Some(&wo));
        let last = tl.last().unwrap();
        assert_eq!(last.milestone, Milestone::Closed);
        assert_eq!(last.status, MilestoneStatus::Current);
        assert_eq!(last.at, Some(6_000));
        assert!(tl[..tl.len() - 1].iter().all(|e| e.status == MilestoneStatus::Complete));
    }

    #[test]
    fn rejected_request_ends_at_rejection() {
        let mut req = request();
        req.status = RequestStatus::Rejected;
        req.decided_at = Some(1_500);
        let tl = project_timeline(&req, None);
        assert_eq!(
            statuses(&tl),
            vec![
                (Milestone::Submitted, MilestoneStatus::Complete),
                (Milestone::PendingConfirmation, MilestoneStatus::Complete),
                (Milestone::Rejected, MilestoneStatus::Current),
            ]
        );
    }
}
