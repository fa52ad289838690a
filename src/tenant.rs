use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create the engine for a tenant. Names are case-insensitive.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        let key = tenant_key(tenant)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to open the same tenant; only one engine may own the WAL.
        let entry = self.engines.entry(key.clone()).or_try_insert_with(|| {
            let wal_path = self.data_dir.join(format!("{key}.wal"));
            let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
            let compactor_engine = engine.clone();
            let threshold = self.compact_threshold;
            tokio::spawn(async move {
                compactor::run_compactor(compactor_engine, threshold).await;
            });
            info!("opened tenant {tenant} ({} lots)", engine.state.len());
            Ok::<_, std::io::Error>(engine)
        })?;
        let engine = entry.value().clone();
        drop(entry);

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

/// Map a database name to its engine key, which is also its WAL file stem.
/// Only names that are already file-safe are accepted, so distinct keys never share a log.
fn tenant_key(tenant: &str) -> std::io::Result<String> {
    let invalid = |msg: String| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg);
    if tenant.is_empty() {
        return Err(invalid("empty tenant name".into()));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(invalid("tenant name too long".into()));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid(format!(
            "invalid tenant name {tenant:?}: use letters, digits, '_' or '-'"
        )));
    }
    Ok(tenant.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn new_lot(id: Ulid) -> NewLot {
        NewLot {
            id,
            name: "Mall".into(),
            address: "5 Ring Rd".into(),
            postal_code: "20002".into(),
            unit_price: Money::from_cents(1000),
            capacity: 2,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        let lot = Ulid::new();
        eng_a.create_lot(new_lot(lot)).await.unwrap();
        eng_b.create_lot(new_lot(lot)).await.unwrap();

        eng_a.allocate(lot, "dave").await.unwrap();

        assert_eq!(eng_a.get_lot(lot).await.unwrap().available, 1);
        assert_eq!(eng_b.get_lot(lot).await.unwrap().available, 2);
        assert!(eng_b.list_open_reservations_for("dave").await.is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_with_path_characters_rejected() {
        let dir = test_data_dir("reject_names");
        let tm = TenantManager::new(dir.clone(), 1000);

        for name in ["../evil", "../..", "ci.ty", "a/b", "", "caf\u{e9}"] {
            let err = tm.get_or_create(name).err().unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "{name:?}");
        }
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn lookalike_names_do_not_share_a_log() {
        let dir = test_data_dir("lookalike");
        let lot = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let city = tm.get_or_create("city").unwrap();
            assert!(tm.get_or_create("ci.ty").is_err());
            let other = tm.get_or_create("city_2").unwrap();
            assert!(!Arc::ptr_eq(&city, &other));
            assert!(Arc::ptr_eq(&city, &tm.get_or_create("CITY").unwrap()));
            other.create_lot(new_lot(lot)).await.unwrap();
        }

        let tm = TenantManager::new(dir, 1000);
        let city = tm.get_or_create("city").unwrap();
        assert!(city.get_lot(lot).await.is_err());
        assert!(tm.get_or_create("city_2").unwrap().get_lot(lot).await.is_ok());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_state_survives_reopen() {
        let dir = test_data_dir("reopen");
        let lot = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let eng = tm.get_or_create("city").unwrap();
            eng.create_lot(new_lot(lot)).await.unwrap();
            eng.allocate(lot, "erin").await.unwrap();
        }

        let tm = TenantManager::new(dir, 1000);
        let eng = tm.get_or_create("city").unwrap();
        assert_eq!(eng.get_lot(lot).await.unwrap().available, 1);
        assert_eq!(eng.list_open_reservations_for("erin").await.len(), 1);
    }
}
