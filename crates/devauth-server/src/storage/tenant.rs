//! Tenant-scoped database selection.
//!
//! Every tenant gets its own `SQLite` file under the data directory; requests
//! without a tenant use the default namespace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use devauth_core::db::unix_timestamp;
use tracing::info;

use super::db::{DatabaseError, DeviceDatabase};
use crate::migrate::Migrator;

const DB_NAME: &str = "deviceauth";
const MAX_TENANT_ID_LEN: usize = 64;

/// Validated tenant identifier, safe to embed in a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, DatabaseError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_TENANT_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(DatabaseError::Connection(format!("Invalid tenant id: {raw:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Database file for a tenant (`deviceauth.db` or `deviceauth-<tenant>.db`).
pub fn database_file(data_dir: &Path, tenant: Option<&TenantId>) -> PathBuf {
    match tenant {
        Some(t) => data_dir.join(format!("{DB_NAME}-{t}.db")),
        None => data_dir.join(format!("{DB_NAME}.db")),
    }
}

/// Lazily opened per-tenant databases.
pub struct TenantDatabases {
    data_dir: PathBuf,
    automigrate: bool,
    open: Mutex<HashMap<Option<TenantId>, DeviceDatabase>>,
}

impl TenantDatabases {
    pub fn new(data_dir: PathBuf, automigrate: bool) -> Self {
        Self {
            data_dir,
            automigrate,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Database for `tenant`, opening it on first use. Opening runs data
    /// migrations when enabled and drops expired token records.
    pub async fn get(&self, tenant: Option<&TenantId>) -> Result<DeviceDatabase, DatabaseError> {
        let mut open = self.open.lock().await;
        if let Some(db) = open.get(&tenant.cloned()) {
            return Ok(db.clone());
        }

        let path = database_file(&self.data_dir, tenant);
        let db = DeviceDatabase::open(&path).await?;
        if self.automigrate {
            let report = Migrator::with_default_steps()
                .run(&db)
                .await
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            info!(
                tenant = tenant.map_or("default", TenantId::as_str),
                applied = report.applied.len(),
                "Tenant database ready"
            );
        }

        let purged = db.delete_expired_tokens(unix_timestamp()).await?;
        if purged > 0 {
            info!(
                tenant = tenant.map_or("default", TenantId::as_str),
                purged, "Expired tokens purged"
            );
        }

        open.insert(tenant.cloned(), db.clone());
        Ok(db)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tenant_ids_are_file_name_safe() {
        assert!(TenantId::parse("acme-01_eu").is_ok());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("../etc").is_err());
        assert!(TenantId::parse("a/b").is_err());
        assert!(TenantId::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn database_file_per_tenant() {
        let dir = Path::new("/data");
        let tenant = TenantId::parse("acme").unwrap();
        assert_eq!(database_file(dir, None), Path::new("/data/deviceauth.db"));
        assert_eq!(
            database_file(dir, Some(&tenant)),
            Path::new("/data/deviceauth-acme.db")
        );
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantDatabases::new(dir.path().to_path_buf(), true);
        let acme = TenantId::parse("acme").unwrap();

        let default_db = registry.get(None).await.unwrap();
        let acme_db = registry.get(Some(&acme)).await.unwrap();

        default_db
            .insert_device(&crate::storage::NewDevice {
                id: "d1",
                identity_data: r#"{"sn":"1"}"#,
                identity_struct: r#"{"sn":"1"}"#,
                identity_hash: "h1",
                status: crate::storage::Status::Pending,
            })
            .await
            .unwrap();

        assert!(default_db.get_device("d1").await.is_ok());
        assert!(acme_db.get_device("d1").await.is_err());
        assert!(dir.path().join("deviceauth-acme.db").exists());
    }

    #[tokio::test]
    async fn automigrate_sets_marker_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantDatabases::new(dir.path().to_path_buf(), true);

        let db = registry.get(None).await.unwrap();
        let version = db.get_migration_version().await.unwrap();
        assert_eq!(version.as_deref(), Some("1.1.0"));

        // Cached handle, same pool.
        let again = registry.get(None).await.unwrap();
        assert_eq!(
            again.get_migration_version().await.unwrap().as_deref(),
            Some("1.1.0")
        );
    }

    #[tokio::test]
    async fn without_automigrate_marker_is_unset() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantDatabases::new(dir.path().to_path_buf(), false);
        let db = registry.get(None).await.unwrap();
        assert!(db.get_migration_version().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opening_purges_expired_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let now = unix_timestamp();
        {
            let registry = TenantDatabases::new(dir.path().to_path_buf(), true);
            let db = registry.get(None).await.unwrap();
            db.insert_device(&crate::storage::NewDevice {
                id: "d1",
                identity_data: r#"{"sn":"1"}"#,
                identity_struct: r#"{"sn":"1"}"#,
                identity_hash: "h1",
                status: crate::storage::Status::Pending,
            })
            .await
            .unwrap();
            db.update_device_status("d1", crate::storage::Status::Accepted, "KEY", now)
                .await
                .unwrap();
            db.add_token("old", "d1", None, now - 60).await.unwrap().unwrap();
            db.add_token("live", "d1", None, now + 3600).await.unwrap().unwrap();
        }

        let registry = TenantDatabases::new(dir.path().to_path_buf(), false);
        let db = registry.get(None).await.unwrap();
        assert!(db.get_token("old").await.is_err());
        assert!(!db.is_token_revoked("live").await.unwrap());
    }
}
