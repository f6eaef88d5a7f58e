//! Versioned data migrations.
//!
//! Schema changes are plain SQL applied by `sqlx::migrate!` when a database
//! opens. Data migrations that re-derive stored fields run here: an ordered
//! list of steps, each tagged with a semantic version and applied at most
//! once. A step and the marker recording it commit in one transaction, so a
//! failed step leaves the marker at the previous version.

mod backfill;

use async_trait::async_trait;
use semver::Version;
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use crate::identity::IdentityError;
use crate::storage::{DatabaseError, DeviceDatabase, write_migration_version};

pub use backfill::IdentityBackfill;

/// Errors from running data migrations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Stored migration version is not semver: {0}")]
    InvalidMarker(String),

    #[error("Migration {next} is not ordered after {previous}")]
    OutOfOrder { previous: Version, next: Version },

    #[error("Malformed identity in {table} row {id}: {source}")]
    MalformedIdentity {
        table: &'static str,
        id: String,
        #[source]
        source: IdentityError,
    },

    #[error("Device {device_id} has multiple accepted auth sets: {}", auth_set_ids.join(", "))]
    MultipleAcceptedAuthSets {
        device_id: String,
        auth_set_ids: Vec<String>,
    },

    #[error("Migration {version} failed: {source}")]
    Step {
        version: Version,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for MigrationError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.into())
    }
}

/// Rows touched by one migration step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub devices_updated: u64,
    pub auth_sets_updated: u64,
}

/// Outcome of [`Migrator::run`].
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Versions applied by this run, in order, with what each changed.
    pub applied: Vec<(Version, StepReport)>,
    /// Marker after the run.
    pub version: Option<Version>,
}

/// One idempotent data migration.
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> Version;

    fn name(&self) -> &'static str;

    /// Apply the step on `conn`, which is inside the step's transaction.
    async fn up(&self, conn: &mut SqliteConnection) -> Result<StepReport, MigrationError>;
}

/// Applies data migrations in version order.
pub struct Migrator {
    steps: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// Build a migrator. Steps must be listed in strictly increasing
    /// version order.
    pub fn new(steps: Vec<Box<dyn Migration>>) -> Result<Self, MigrationError> {
        for pair in steps.windows(2) {
            let (previous, next) = (pair[0].version(), pair[1].version());
            if next <= previous {
                return Err(MigrationError::OutOfOrder { previous, next });
            }
        }
        Ok(Self { steps })
    }

    /// The migrations shipped with this release.
    pub fn with_default_steps() -> Self {
        Self {
            steps: vec![Box::new(IdentityBackfill)],
        }
    }

    /// Version of the newest known step.
    pub fn latest_version(&self) -> Option<Version> {
        self.steps.last().map(|s| s.version())
    }

    /// Apply every step newer than the stored marker.
    #[instrument(skip_all)]
    pub async fn run(&self, db: &DeviceDatabase) -> Result<MigrationReport, MigrationError> {
        let mut current = match db.get_migration_version().await? {
            Some(raw) => Some(
                Version::parse(&raw).map_err(|_| MigrationError::InvalidMarker(raw.clone()))?,
            ),
            None => None,
        };

        if let (Some(stored), Some(latest)) = (&current, self.latest_version()) {
            if *stored > latest {
                warn!(%stored, %latest, "Database was migrated by a newer release");
            }
        }

        let mut report = MigrationReport::default();
        for step in &self.steps {
            let version = step.version();
            if current.as_ref().is_some_and(|c| *c >= version) {
                continue;
            }

            info!(%version, name = step.name(), "Applying data migration");
            let step_report = self.apply(db, step.as_ref()).await.map_err(|e| {
                MigrationError::Step {
                    version: version.clone(),
                    source: Box::new(e),
                }
            })?;
            info!(
                %version,
                devices_updated = step_report.devices_updated,
                auth_sets_updated = step_report.auth_sets_updated,
                "Data migration applied"
            );

            report.applied.push((version.clone(), step_report));
            current = Some(version);
        }

        report.version = current;
        Ok(report)
    }

    async fn apply(
        &self,
        db: &DeviceDatabase,
        step: &dyn Migration,
    ) -> Result<StepReport, MigrationError> {
        let mut tx = db.pool().begin().await?;
        let report = step.up(&mut tx).await?;
        write_migration_version(&mut tx, &step.version().to_string()).await?;
        tx.commit().await?;
        Ok(report)
    }
}
