//! 1.1.0: derive canonical identity columns and re-derive device status.

use std::collections::HashMap;

use async_trait::async_trait;
use devauth_core::db::unix_timestamp;
use semver::Version;
use sqlx::SqliteConnection;
use tracing::debug;

use super::{Migration, MigrationError, StepReport};
use crate::devices::derive_status;
use crate::identity::canonicalize;
use crate::storage::{AuthSet, Device};

/// Fills `identity_struct` and `identity_hash` for every auth set and
/// device from its raw `identity_data`, then recomputes each device's
/// status and public key from its auth sets.
///
/// Only rows whose values change are written. Auth set timestamps are left
/// alone; a device's `updated_at` moves only when the device row changes.
pub struct IdentityBackfill;

#[async_trait]
impl Migration for IdentityBackfill {
    fn version(&self) -> Version {
        Version::new(1, 1, 0)
    }

    fn name(&self) -> &'static str {
        "identity backfill"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> Result<StepReport, MigrationError> {
        let mut report = StepReport::default();

        let auth_sets = sqlx::query_as::<_, AuthSet>("SELECT * FROM auth_sets ORDER BY rowid")
            .fetch_all(&mut *conn)
            .await?;

        let mut by_device: HashMap<String, Vec<AuthSet>> = HashMap::new();
        for mut auth_set in auth_sets {
            let identity = canonicalize(&auth_set.identity_data).map_err(|source| {
                MigrationError::MalformedIdentity {
                    table: "auth_sets",
                    id: auth_set.id.clone(),
                    source,
                }
            })?;
            let hash = identity.hash_hex();

            if auth_set.identity_struct != identity.canonical_json()
                || auth_set.identity_hash != hash
            {
                sqlx::query(
                    "UPDATE auth_sets SET identity_struct = ?, identity_hash = ? WHERE id = ?",
                )
                .bind(identity.canonical_json())
                .bind(&hash)
                .bind(&auth_set.id)
                .execute(&mut *conn)
                .await?;
                report.auth_sets_updated += 1;
                auth_set.identity_struct = identity.canonical_json().to_string();
                auth_set.identity_hash = hash;
            }

            by_device
                .entry(auth_set.device_id.clone())
                .or_default()
                .push(auth_set);
        }

        let devices = sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY created_at, id")
            .fetch_all(&mut *conn)
            .await?;

        let now = unix_timestamp();
        for device in devices {
            let identity = canonicalize(&device.identity_data).map_err(|source| {
                MigrationError::MalformedIdentity {
                    table: "devices",
                    id: device.id.clone(),
                    source,
                }
            })?;
            let hash = identity.hash_hex();

            let sets = by_device.get(&device.id).map_or(&[][..], Vec::as_slice);
            let derived =
                derive_status(sets).map_err(|c| MigrationError::MultipleAcceptedAuthSets {
                    device_id: device.id.clone(),
                    auth_set_ids: c.auth_set_ids,
                })?;

            let identity_changed =
                device.identity_struct != identity.canonical_json() || device.identity_hash != hash;
            if !identity_changed && !derived.differs_from(&device) {
                continue;
            }

            sqlx::query(
                "UPDATE devices SET identity_struct = ?, identity_hash = ?, status = ?, public_key = ?, updated_at = ? WHERE id = ?",
            )
            .bind(identity.canonical_json())
            .bind(&hash)
            .bind(derived.status)
            .bind(derived.public_key_for(&device))
            .bind(now)
            .bind(&device.id)
            .execute(&mut *conn)
            .await?;

            debug!(
                device_id = %device.id,
                from = %device.status,
                to = %derived.status,
                "Device backfilled"
            );
            report.devices_updated += 1;
        }

        Ok(report)
    }
}
