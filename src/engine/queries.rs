use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::TimeBlock;
use crate::history::{project_timeline, TimelineEntry};
use crate::model::*;

use super::availability;
use super::guard::today;
use super::{Engine, EngineError, ValidationError};

impl Engine {
    /// Free blocks on `date`, in schedule order.
    pub async fn available_blocks(&self, date: NaiveDate) -> Result<Vec<TimeBlock>, EngineError> {
        self.available_blocks_at(date, today()).await
    }

    pub(crate) async fn available_blocks_at(
        &self,
        date: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<TimeBlock>, EngineError> {
        if !self.schedule.in_horizon(date, today) {
            let (min, max) = self.schedule.horizon(today);
            return Err(ValidationError::OutsideHorizon { date, min, max }.into());
        }
        Ok(match self.existing_day(date) {
            Some(day) => availability::available_blocks(&self.schedule, date, &day.read().await.requests),
            None => self.schedule.blocks_for(date).to_vec(),
        })
    }

    /// Dates from today through the horizon with at least one free block.
    pub async fn available_dates(&self) -> Vec<NaiveDate> {
        self.available_dates_at(today()).await
    }

    pub(crate) async fn available_dates_at(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let mut active = Vec::new();
        for date in self.schedule.horizon_dates(today) {
            if let Some(day) = self.existing_day(date) {
                let guard = day.read().await;
                active.extend(guard.requests.iter().filter(|r| r.status.holds_slot()).cloned());
            }
        }
        availability::available_dates(&self.schedule, today, &active)
    }

    pub async fn get_request(&self, id: Ulid) -> Result<DiagnosticRequest, EngineError> {
        loop {
            let filed = self.filed_date(id)?;
            if let Some(day) = self.existing_day(filed)
                && let Some(request) = day.read().await.get(id)
            {
                return Ok(request.clone());
            }
            if self.filed_date(id)? == filed {
                return Err(EngineError::NotFound(id));
            }
        }
    }

    pub async fn get_work_order(&self, id: Ulid) -> Result<WorkOrder, EngineError> {
        let lock = self.get_work_order_lock(id)?;
        let wo = lock.read().await;
        Ok(wo.clone())
    }

    /// Milestone timeline for a request and, once confirmed, its work order.
    pub async fn timeline(&self, request_id: Ulid) -> Result<Vec<TimelineEntry>, EngineError> {
        let request = self.get_request(request_id).await?;
        let work_order = match request.work_order_id {
            Some(wo_id) => Some(self.get_work_order(wo_id).await?),
            None => None,
        };
        Ok(project_timeline(&request, work_order.as_ref()))
    }

    /// Pending requests, urgent first, then oldest submission first.
    pub async fn pending_queue(&self) -> Vec<DiagnosticRequest> {
        let days: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut pending = Vec::new();
        for day in days {
            let guard = day.read().await;
            pending.extend(
                guard
                    .requests
                    .iter()
                    .filter(|r| r.status == RequestStatus::PendingConfirmation)
                    .cloned(),
            );
        }
        pending.sort_by_key(|r| (r.priority != Priority::Urgent, r.submitted_at, r.id));
        pending
    }

    /// Every transition recorded for one entity, oldest first.
    pub fn transition_log(&self, id: Ulid) -> Vec<Transition> {
        self.transitions.get(&id).map(|e| e.value().clone()).unwrap_or_default()
    }

    pub fn get_vehicle(&self, id: Ulid) -> Option<Vehicle> {
        self.vehicles.get(&id).map(|e| e.value().clone())
    }

    pub fn list_vehicles(&self) -> Vec<Vehicle> {
        let mut vehicles: Vec<Vehicle> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        vehicles.sort_by_key(|v| v.id);
        vehicles
    }

    /// Pending requests whose date has passed, or that were submitted more
    /// than `ttl_ms` before `now`. Days locked by a writer are skipped until
    /// the next sweep.
    pub fn collect_expired_requests(&self, today: NaiveDate, now: Ms, ttl_ms: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for entry in self.days.iter() {
            let day = entry.value().clone();
            if let Ok(guard) = day.try_read() {
                expired.extend(
                    guard
                        .requests
                        .iter()
                        .filter(|r| r.status == RequestStatus::PendingConfirmation)
                        .filter(|r| r.requested_date < today || now - r.submitted_at > ttl_ms)
                        .map(|r| r.id),
                );
            }
        }
        expired
    }
}
