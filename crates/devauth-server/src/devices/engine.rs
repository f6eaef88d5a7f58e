//! Auth set lifecycle and device status maintenance.

use devauth_core::db::unix_timestamp;
use tracing::{debug, info, instrument, warn};

use super::status::derive_status;
use crate::identity::{CanonicalIdentity, IdentityError, canonicalize};
use crate::storage::{
    AuthSet, DatabaseError, Device, DeviceDatabase, NewAuthSet, NewDevice, Status,
};

/// Errors from the auth set state engine.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Auth set not found: {0}")]
    AuthSetNotFound(String),

    #[error(transparent)]
    MalformedIdentity(#[from] IdentityError),

    #[error("Device {device_id} has multiple accepted auth sets: {}", auth_set_ids.join(", "))]
    MultipleAcceptedAuthSets {
        device_id: String,
        auth_set_ids: Vec<String>,
    },

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Operator or policy verdict on an auth set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub const fn status(self) -> Status {
        match self {
            Self::Accept => Status::Accepted,
            Self::Reject => Status::Rejected,
        }
    }
}

/// Result of [`DeviceAuthEngine::decide_auth_set`].
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub auth_set: AuthSet,
    pub device: Device,
    /// The auth set left `accepted`: tokens issued under it must be revoked.
    pub revoke_tokens: bool,
}

/// Owns auth set transitions and keeps each device's derived status current.
#[derive(Clone)]
pub struct DeviceAuthEngine {
    db: DeviceDatabase,
}

impl DeviceAuthEngine {
    pub const fn new(db: DeviceDatabase) -> Self {
        Self { db }
    }

    pub const fn db(&self) -> &DeviceDatabase {
        &self.db
    }

    /// Record an authentication attempt.
    ///
    /// The device is looked up by identity hash; when none matches, the
    /// auth set attaches to `device_id` (created if unknown, or with a fresh
    /// id when `None`). Resubmitting the same identity and key returns the
    /// existing auth set with its current status.
    #[instrument(skip(self, identity_data, public_key))]
    pub async fn submit_auth_set(
        &self,
        device_id: Option<&str>,
        identity_data: &str,
        public_key: &str,
    ) -> Result<AuthSet, DeviceError> {
        let identity = canonicalize(identity_data)?;
        let hash = identity.hash_hex();
        let device = self
            .resolve_device(device_id, identity_data, &identity)
            .await?;

        let auth_set = if let Some(existing) =
            self.db.find_auth_set(&device.id, &hash, public_key).await?
        {
            debug!(auth_set_id = %existing.id, "Reusing existing auth set");
            existing
        } else {
            let id = uuid::Uuid::new_v4().to_string();
            let inserted = self
                .db
                .insert_auth_set(&NewAuthSet {
                    id: &id,
                    device_id: &device.id,
                    identity_data,
                    identity_struct: identity.canonical_json(),
                    identity_hash: &hash,
                    public_key,
                    status: Status::Pending,
                })
                .await;
            match inserted {
                Ok(auth_set) => {
                    info!(device_id = %device.id, auth_set_id = %auth_set.id, "Auth set submitted");
                    auth_set
                }
                Err(e) if e.is_conflict() => self
                    .db
                    .find_auth_set(&device.id, &hash, public_key)
                    .await?
                    .ok_or(e)?,
                Err(e) => return Err(e.into()),
            }
        };

        self.recompute_device_status(&device.id).await?;
        Ok(auth_set)
    }

    async fn resolve_device(
        &self,
        device_id: Option<&str>,
        identity_data: &str,
        identity: &CanonicalIdentity,
    ) -> Result<Device, DeviceError> {
        let hash = identity.hash_hex();

        if let Some(found) = self.db.find_device_by_identity_hash(&hash).await? {
            if let Some(requested) = device_id.filter(|id| *id != found.id) {
                warn!(
                    requested,
                    matched = %found.id,
                    "Identity hash already registered to another device, using first match"
                );
            }
            return Ok(found);
        }

        if let Some(id) = device_id {
            match self.db.get_device(id).await {
                Ok(device) => return Ok(device),
                Err(DatabaseError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let id = device_id.map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string);
        let inserted = self
            .db
            .insert_device(&NewDevice {
                id: &id,
                identity_data,
                identity_struct: identity.canonical_json(),
                identity_hash: &hash,
                status: Status::Pending,
            })
            .await;

        match inserted {
            Ok(device) => {
                info!(device_id = %device.id, "Device created");
                Ok(device)
            }
            // A concurrent submission created it first: read theirs, once.
            Err(e) if e.is_conflict() => {
                debug!(identity_hash = %hash, "Device creation raced, reading existing row");
                Ok(self.db.find_device_by_identity_hash(&hash).await?.ok_or(e)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Accept or reject an auth set and recompute its device.
    ///
    /// Accepting while a sibling auth set is already accepted fails with
    /// [`DeviceError::MultipleAcceptedAuthSets`] and writes nothing.
    #[instrument(skip(self))]
    pub async fn decide_auth_set(
        &self,
        auth_set_id: &str,
        decision: Decision,
    ) -> Result<DecisionOutcome, DeviceError> {
        let current = self.auth_set(auth_set_id).await?;
        let new_status = decision.status();

        if decision == Decision::Accept {
            let others: Vec<String> = self
                .db
                .list_auth_sets_for_device(&current.device_id)
                .await?
                .into_iter()
                .filter(|a| a.status == Status::Accepted && a.id != current.id)
                .map(|a| a.id)
                .collect();
            if !others.is_empty() {
                let mut auth_set_ids = others;
                auth_set_ids.push(current.id.clone());
                return Err(DeviceError::MultipleAcceptedAuthSets {
                    device_id: current.device_id,
                    auth_set_ids,
                });
            }
        }

        self.db.update_auth_set_status(auth_set_id, new_status).await?;
        let device = self.recompute_device_status(&current.device_id).await?;
        let auth_set = self.auth_set(auth_set_id).await?;
        let revoke_tokens = current.status == Status::Accepted && new_status != Status::Accepted;

        info!(
            device_id = %device.id,
            auth_set_id,
            from = %current.status,
            to = %new_status,
            device_status = %device.status,
            "Auth set decided"
        );

        Ok(DecisionOutcome {
            auth_set,
            device,
            revoke_tokens,
        })
    }

    /// Re-derive a device's status from its auth sets and persist it when it
    /// changed. `updated_at` only moves on an actual change.
    pub async fn recompute_device_status(&self, device_id: &str) -> Result<Device, DeviceError> {
        let mut device = self.device(device_id).await?;
        let auth_sets = self.db.list_auth_sets_for_device(device_id).await?;

        let derived =
            derive_status(&auth_sets).map_err(|c| DeviceError::MultipleAcceptedAuthSets {
                device_id: device_id.to_string(),
                auth_set_ids: c.auth_set_ids,
            })?;

        if derived.differs_from(&device) {
            let public_key = derived.public_key_for(&device).to_string();
            let now = unix_timestamp();
            self.db
                .update_device_status(device_id, derived.status, &public_key, now)
                .await?;
            debug!(device_id, from = %device.status, to = %derived.status, "Device status changed");
            device.status = derived.status;
            device.public_key = public_key;
            device.updated_at = now;
        }

        Ok(device)
    }

    /// Current status of a device, read from storage.
    pub async fn get_device_status(&self, device_id: &str) -> Result<Status, DeviceError> {
        Ok(self.device(device_id).await?.status)
    }

    /// Flag a device for removal. Status and auth sets are untouched.
    pub async fn decommission_device(&self, device_id: &str) -> Result<Device, DeviceError> {
        if !self.db.set_device_decommissioning(device_id, true).await? {
            return Err(DeviceError::DeviceNotFound(device_id.to_string()));
        }
        info!(device_id, "Device marked for decommissioning");
        self.device(device_id).await
    }

    pub async fn device(&self, device_id: &str) -> Result<Device, DeviceError> {
        match self.db.get_device(device_id).await {
            Ok(device) => Ok(device),
            Err(DatabaseError::NotFound(_)) => Err(DeviceError::DeviceNotFound(device_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn auth_set(&self, auth_set_id: &str) -> Result<AuthSet, DeviceError> {
        match self.db.get_auth_set(auth_set_id).await {
            Ok(auth_set) => Ok(auth_set),
            Err(DatabaseError::NotFound(_)) => {
                Err(DeviceError::AuthSetNotFound(auth_set_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_auth_sets(&self, device_id: &str) -> Result<Vec<AuthSet>, DeviceError> {
        self.device(device_id).await?;
        Ok(self.db.list_auth_sets_for_device(device_id).await?)
    }
}
