//! Device and auth set queries.

use devauth_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{DatabaseError, DeviceDatabase};
use super::models::{AuthSet, Device, NewAuthSet, NewDevice, Status};

impl DeviceDatabase {
    // =========================================================================
    // Device queries
    // =========================================================================

    /// Create a device. A second device with the same non-empty identity
    /// hash fails with [`DatabaseError::Conflict`].
    pub async fn insert_device(&self, device: &NewDevice<'_>) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO devices (id, identity_data, identity_struct, identity_hash, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(device.id)
        .bind(device.identity_data)
        .bind(device.identity_struct)
        .bind(device.identity_hash)
        .bind(device.status)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(device.id).await
    }

    /// Get a device by ID.
    pub async fn get_device(&self, id: &str) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {id}")))
    }

    /// Find the device registered under an identity hash.
    pub async fn find_device_by_identity_hash(
        &self,
        identity_hash: &str,
    ) -> Result<Option<Device>, DatabaseError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE identity_hash = ?")
            .bind(identity_hash)
            .fetch_optional(self.pool())
            .await?;

        Ok(device)
    }

    /// List devices, optionally filtered by status.
    pub async fn list_devices(&self, status: Option<Status>) -> Result<Vec<Device>, DatabaseError> {
        let devices = if let Some(status) = status {
            sqlx::query_as::<_, Device>(
                "SELECT * FROM devices WHERE status = ? ORDER BY created_at, id",
            )
            .bind(status)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY created_at, id")
                .fetch_all(self.pool())
                .await?
        };

        Ok(devices)
    }

    /// Write the derived status and active public key of a device.
    pub async fn update_device_status(
        &self,
        id: &str,
        status: Status,
        public_key: &str,
        updated_at: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE devices SET status = ?, public_key = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(public_key)
        .bind(updated_at)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Device {id}")));
        }
        Ok(())
    }

    /// Set the decommissioning flag. Returns `false` if the device is unknown.
    pub async fn set_device_decommissioning(
        &self,
        id: &str,
        decommissioning: bool,
    ) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();

        let result =
            sqlx::query("UPDATE devices SET decommissioning = ?, updated_at = ? WHERE id = ?")
                .bind(decommissioning)
                .bind(now)
                .bind(id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Auth set queries
    // =========================================================================

    /// Create an auth set.
    pub async fn insert_auth_set(&self, auth_set: &NewAuthSet<'_>) -> Result<AuthSet, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO auth_sets (id, device_id, identity_data, identity_struct, identity_hash, public_key, status, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(auth_set.id)
        .bind(auth_set.device_id)
        .bind(auth_set.identity_data)
        .bind(auth_set.identity_struct)
        .bind(auth_set.identity_hash)
        .bind(auth_set.public_key)
        .bind(auth_set.status)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_auth_set(auth_set.id).await
    }

    /// Get an auth set by ID.
    pub async fn get_auth_set(&self, id: &str) -> Result<AuthSet, DatabaseError> {
        sqlx::query_as::<_, AuthSet>("SELECT * FROM auth_sets WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Auth set {id}")))
    }

    /// Find a device's auth set for an exact identity and public key.
    pub async fn find_auth_set(
        &self,
        device_id: &str,
        identity_hash: &str,
        public_key: &str,
    ) -> Result<Option<AuthSet>, DatabaseError> {
        let auth_set = sqlx::query_as::<_, AuthSet>(
            "SELECT * FROM auth_sets WHERE device_id = ? AND identity_hash = ? AND public_key = ?",
        )
        .bind(device_id)
        .bind(identity_hash)
        .bind(public_key)
        .fetch_optional(self.pool())
        .await?;

        Ok(auth_set)
    }

    /// Set an auth set's status and stamp the change time.
    pub async fn update_auth_set_status(
        &self,
        id: &str,
        status: Status,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query("UPDATE auth_sets SET status = ?, timestamp = ? WHERE id = ?")
            .bind(status)
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Auth set {id}")));
        }
        Ok(())
    }

    /// All auth sets of a device in submission order.
    pub async fn list_auth_sets_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<AuthSet>, DatabaseError> {
        let auth_sets = sqlx::query_as::<_, AuthSet>(
            "SELECT * FROM auth_sets WHERE device_id = ? ORDER BY rowid",
        )
        .bind(device_id)
        .fetch_all(self.pool())
        .await?;

        Ok(auth_sets)
    }

    // =========================================================================
    // Migration marker
    // =========================================================================

    /// Version of the last data migration that committed, if any.
    pub async fn get_migration_version(&self) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT version FROM migration_marker WHERE id = 1")
                .fetch_optional(self.pool())
                .await?;

        Ok(row.map(|(version,)| version))
    }
}

/// Record `version` as the last applied data migration. Runs on the caller's
/// connection so it commits together with the migration's own writes.
pub async fn write_migration_version(
    conn: &mut SqliteConnection,
    version: &str,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO migration_marker (id, version, applied_at) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, applied_at = excluded.applied_at",
    )
    .bind(version)
    .bind(unix_timestamp())
    .execute(conn)
    .await?;

    Ok(())
}
