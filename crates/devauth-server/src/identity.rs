//! Device identity canonicalization.
//!
//! A device reports its identity as a flat JSON object of string attributes
//! (`{"mac":"00:00:00:01","sn":"0001"}`). The canonical form is the decoded
//! attribute map with sorted keys; the identity hash is the SHA-256 of the
//! raw payload bytes exactly as reported, so two payloads that differ only in
//! key order decode to equal structures but hash differently.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Errors from identity decoding.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Malformed identity data: {0}")]
    Malformed(String),
}

/// Decoded identity plus the content hash of the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalIdentity {
    attributes: BTreeMap<String, String>,
    canonical: String,
    hash: [u8; 32],
}

impl CanonicalIdentity {
    /// Attribute name to value, ordered by name.
    pub const fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Canonical JSON encoding of the attributes (sorted keys, no whitespace).
    pub fn canonical_json(&self) -> &str {
        &self.canonical
    }

    /// SHA-256 of the raw payload.
    pub const fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Lowercase hex SHA-256 of the raw payload, as stored.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Decode a raw identity payload and hash it.
///
/// The payload must be a flat JSON object of string values. An empty object
/// `{}` is refused as [`IdentityError::Malformed`]: an identity needs at least
/// one attribute to tell devices apart.
pub fn canonicalize(raw: &str) -> Result<CanonicalIdentity, IdentityError> {
    let attributes: BTreeMap<String, String> = serde_json::from_str(raw)
        .map_err(|e| IdentityError::Malformed(format!("expected a flat string map: {e}")))?;

    if attributes.is_empty() {
        return Err(IdentityError::Malformed(
            "identity has no attributes".to_string(),
        ));
    }

    let canonical = serde_json::to_string(&attributes)
        .map_err(|e| IdentityError::Malformed(e.to_string()))?;

    Ok(CanonicalIdentity {
        attributes,
        canonical,
        hash: identity_hash(raw),
    })
}

/// SHA-256 of the raw payload bytes.
pub fn identity_hash(raw: &str) -> [u8; 32] {
    Sha256::digest(raw.as_bytes()).into()
}
