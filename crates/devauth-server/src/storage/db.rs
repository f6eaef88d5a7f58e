//! `SQLite` database for devauth.

use std::path::Path;

use sqlx::{Pool, Sqlite};
use tracing::info;

pub use devauth_core::db::DatabaseError;

/// One logical device database (one tenant namespace).
#[derive(Clone)]
pub struct DeviceDatabase {
    pool: Pool<Sqlite>,
}

impl DeviceDatabase {
    /// Open or create a database at the given path and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let pool = devauth_core::db::open_pool(path).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let pool = devauth_core::db::open_pool_in_memory().await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Apply the SQL schema migrations. Data backfills live in
    /// [`crate::migrate`] and are tracked separately.
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Device database schema migrations complete");
        Ok(())
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
