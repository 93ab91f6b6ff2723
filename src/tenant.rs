use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::calendar::Schedule;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// One engine per workshop, keyed by the connection's database name.
/// Every workshop shares the configured schedule but has its own WAL,
/// notify hub and expiry sweep.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    schedule: Arc<Schedule>,
    pending_ttl_days: Option<u32>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, schedule: Arc<Schedule>, pending_ttl_days: Option<u32>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            schedule,
            pending_ttl_days,
        }
    }

    /// Get or lazily open the engine for `tenant`, replaying its WAL.
    ///
    /// Names that sanitize to the same file name resolve to the same engine,
    /// since they share one WAL.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Only these characters reach the filesystem.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to open the same tenant; the loser's
        // engine is dropped before it spawns anything.
        let entry = self.engines.entry(safe_name.clone());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            self.schedule.clone(),
            Arc::new(NotifyHub::new()),
        )?);

        if let Some(ttl) = self.pending_ttl_days {
            tokio::spawn(reaper::run_expiry_sweep(engine.clone(), ttl));
        }

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant = %safe_name, "workshop opened");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Datelike, Days, Weekday};
    use ulid::Ulid;

    use super::*;
    use crate::engine::{self, ConfirmRequest};
    use crate::model::*;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetbay_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, Arc::new(Schedule::default()), None)
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let north = tm.get_or_create("north_depot").unwrap();
        let south = tm.get_or_create("south_depot").unwrap();

        // Same vehicle id registered in both workshops.
        let vehicle = Ulid::new();
        north.register_vehicle(vehicle, None).await.unwrap();
        south.register_vehicle(vehicle, None).await.unwrap();

        let mut date = engine::today() + Days::new(1);
        while date.weekday() != Weekday::Tue {
            date = date + Days::new(1);
        }
        let block = north.schedule().blocks_for(date)[0];
        let req = north
            .submit_request(NewRequest {
                id: Ulid::new(),
                vehicle_id: vehicle,
                requester_id: Ulid::new(),
                date,
                block,
                category: "suspension".into(),
                priority: Priority::Normal,
                notes: None,
                attachments: vec![],
            })
            .await
            .unwrap();
        north
            .confirm_request(
                req.id,
                ConfirmRequest {
                    work_type: "diagnosis".into(),
                    date,
                    block,
                    assignments: Assignments::default(),
                },
            )
            .await
            .unwrap();

        assert!(!north.available_blocks(date).await.unwrap().contains(&block));
        assert!(south.available_blocks(date).await.unwrap().contains(&block));
        assert!(south.get_request(req.id).await.is_err());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_aliases_share_one_engine() {
        let dir = test_data_dir("aliases");
        let tm = manager(dir.clone());
        let north = tm.get_or_create("north").unwrap();
        for alias in ["north.", "no/rth", "../north"] {
            assert!(Arc::ptr_eq(&north, &tm.get_or_create(alias).unwrap()), "{alias}");
        }

        // Both names compete for one slot through the same capacity check.
        let vehicle = Ulid::new();
        north.register_vehicle(vehicle, None).await.unwrap();
        let mut date = engine::today() + Days::new(1);
        while date.weekday() != Weekday::Tue {
            date = date + Days::new(1);
        }
        let block = north.schedule().blocks_for(date)[0];
        let request = |id| NewRequest {
            id,
            vehicle_id: vehicle,
            requester_id: Ulid::new(),
            date,
            block,
            category: "brakes".into(),
            priority: Priority::Normal,
            notes: None,
            attachments: vec![],
        };
        tm.get_or_create("north").unwrap().submit_request(request(Ulid::new())).await.unwrap();
        let err = tm
            .get_or_create("north.")
            .unwrap()
            .submit_request(request(Ulid::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, engine::EngineError::CapacityConflict { .. }));

        // Replay into a fresh manager still shows a single holder.
        let reopened = manager(dir).get_or_create("north").unwrap();
        assert_eq!(reopened.pending_queue().await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let err = tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1)).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }
}
