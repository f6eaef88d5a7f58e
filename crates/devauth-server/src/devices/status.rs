//! Device status derivation.
//!
//! A device's status is a function of its auth sets alone:
//! one accepted auth set makes it `accepted` (and supplies its public key),
//! otherwise any pending auth set makes it `pending`, otherwise `rejected`.
//! Two or more accepted auth sets are a consistency violation.

use crate::storage::{AuthSet, Device, Status};

/// Result of applying the derivation rule to a device's auth sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedStatus {
    pub status: Status,
    /// Public key of the accepted auth set, when there is one.
    pub accepted_key: Option<String>,
}

/// More than one auth set of a device is accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} accepted auth sets: {}", auth_set_ids.len(), auth_set_ids.join(", "))]
pub struct StatusConflict {
    pub auth_set_ids: Vec<String>,
}

/// Apply the derivation rule.
pub fn derive_status(auth_sets: &[AuthSet]) -> Result<DerivedStatus, StatusConflict> {
    let accepted: Vec<&AuthSet> = auth_sets
        .iter()
        .filter(|a| a.status == Status::Accepted)
        .collect();

    match accepted.as_slice() {
        [] => {}
        [only] => {
            return Ok(DerivedStatus {
                status: Status::Accepted,
                accepted_key: Some(only.public_key.clone()),
            });
        }
        many => {
            return Err(StatusConflict {
                auth_set_ids: many.iter().map(|a| a.id.clone()).collect(),
            });
        }
    }

    let status = if auth_sets.iter().any(|a| a.status == Status::Pending) {
        Status::Pending
    } else {
        Status::Rejected
    };

    Ok(DerivedStatus {
        status,
        accepted_key: None,
    })
}

impl DerivedStatus {
    /// Public key the device should carry: the accepted one, or whatever it
    /// already has.
    pub fn public_key_for<'a>(&'a self, device: &'a Device) -> &'a str {
        self.accepted_key.as_deref().unwrap_or(&device.public_key)
    }

    /// Whether writing this result would change the device row.
    pub fn differs_from(&self, device: &Device) -> bool {
        self.status != device.status || self.public_key_for(device) != device.public_key
    }
}
