use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::{Engine, EngineOptions};
use crate::limits::*;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    time_zone: Tz,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, time_zone: Tz) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            time_zone,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
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

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            EngineOptions {
                time_zone: self.time_zone,
                ..EngineOptions::default()
            },
        )?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant, "tenant loaded");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewVehicle;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetline_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn new_vehicle(id: Ulid, plate: &str) -> NewVehicle {
        NewVehicle {
            id,
            admin_org_id: Ulid::new(),
            plate: plate.into(),
            vin: None,
            make: "Renault".into(),
            model: "Clio".into(),
            year: 2022,
            fuel_type: "diesel".into(),
            transmission: "manual".into(),
            seats: 5,
            mileage: 0,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000, Tz::UTC);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same vehicle id and plate in both tenants
        let vid = Ulid::new();
        eng_a.register_vehicle(new_vehicle(vid, "AB123CD"), "ops").await.unwrap();
        eng_b.register_vehicle(new_vehicle(vid, "AB123CD"), "ops").await.unwrap();

        eng_a
            .open_state(vid, VehicleStateKind::Maintenance, eng_a.now(), "service", "ops")
            .await
            .unwrap();

        let state_a = eng_a.current_state(vid).await.unwrap().unwrap();
        let state_b = eng_b.current_state(vid).await.unwrap().unwrap();
        assert_eq!(state_a.state, VehicleStateKind::Maintenance);
        assert_eq!(state_b.state, VehicleStateKind::Available);
    }

    #[tokio::test]
    async fn tenant_time_zone_reaches_engine() {
        let dir = test_data_dir("time_zone");
        let tm = TenantManager::new(dir, 1000, chrono_tz::Europe::Rome);
        let eng = tm.get_or_create("rome").unwrap();
        assert_eq!(eng.time_zone(), chrono_tz::Europe::Rome);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000, Tz::UTC);

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tokio_test::assert_ok!(tm.get_or_create("my_db"));

        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000, Tz::UTC);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();

        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000, Tz::UTC);

        // Path traversal attempt
        let _eng = tokio_test::assert_ok!(tm.get_or_create("../evil"));
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000, Tz::UTC);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000, Tz::UTC);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
