use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::{self, Engine};
use crate::model::Ms;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DAY_MS: Ms = 86_400_000;

/// Reason recorded on requests rejected by the sweep.
pub const EXPIRED_REASON: &str = "expired";

/// Reject stale pending requests once per sweep. Returns how many were rejected.
pub async fn sweep_expired(engine: &Engine, ttl_days: u32, now: Ms) -> usize {
    let expired = engine.collect_expired_requests(engine::today(), now, Ms::from(ttl_days) * DAY_MS);
    let mut rejected = 0;
    for id in expired {
        match engine.reject_request(id, Some(EXPIRED_REASON.into())).await {
            Ok(_) => {
                info!(%id, "expired pending request");
                rejected += 1;
            }
            // A coordinator got there first.
            Err(e) => debug!("expiry sweep skip {id}: {e}"),
        }
    }
    metrics::counter!(crate::observability::REQUESTS_EXPIRED_TOTAL).increment(rejected as u64);
    rejected
}

/// Background task: runs [`sweep_expired`] on a fixed interval.
pub async fn run_expiry_sweep(engine: Arc<Engine>, ttl_days: u32) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        sweep_expired(&engine, ttl_days, now).await;
        engine.notify.prune();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Datelike, Days, Weekday};
    use ulid::Ulid;

    use super::*;
    use crate::calendar::Schedule;
    use crate::engine::EngineError;
    use crate::model::*;
    use crate::notify::NotifyHub;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetbay_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_rejects_requests_older_than_ttl() {
        let path = test_wal_path("sweep_ttl.wal");
        let engine = Engine::new(path, Arc::new(Schedule::default()), Arc::new(NotifyHub::new())).unwrap();

        let vehicle = Ulid::new();
        engine.register_vehicle(vehicle, None).await.unwrap();
        let mut date = engine::today() + Days::new(1);
        while date.weekday() != Weekday::Wed {
            date = date + Days::new(1);
        }
        let block = engine.schedule().blocks_for(date)[0];
        let req = engine
            .submit_request(NewRequest {
                id: Ulid::new(),
                vehicle_id: vehicle,
                requester_id: Ulid::new(),
                date,
                block,
                category: "exhaust".into(),
                priority: Priority::Normal,
                notes: None,
                attachments: vec![],
            })
            .await
            .unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(sweep_expired(&engine, 3, now).await, 0);
        assert_eq!(sweep_expired(&engine, 3, now + 4 * DAY_MS).await, 1);

        let expired = engine.get_request(req.id).await.unwrap();
        assert_eq!(expired.status, RequestStatus::Rejected);
        assert_eq!(expired.rejection_reason.as_deref(), Some(EXPIRED_REASON));
        assert!(engine.available_blocks(date).await.unwrap().contains(&block));

        // Nothing left to expire; a late coordinator sees the terminal state.
        assert_eq!(sweep_expired(&engine, 3, now + 4 * DAY_MS).await, 0);
        assert!(matches!(
            engine.reject_request(req.id, None).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }
}
