//! Data models for devauth storage.

use serde::{Deserialize, Serialize};

/// Authorization status shared by devices and auth sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Accepted,
    Rejected,
}

impl Status {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub identity_data: String,
    pub identity_struct: String,
    pub identity_hash: String,
    pub public_key: String,
    pub status: Status,
    pub decommissioning: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuthSet {
    pub id: String,
    pub device_id: String,
    pub identity_data: String,
    pub identity_struct: String,
    pub identity_hash: String,
    pub public_key: String,
    pub status: Status,
    pub timestamp: i64,
}

/// Issued token bookkeeping; the revocation store keyed by `jti`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IssuedToken {
    pub jti: String,
    pub device_id: String,
    pub expires_at: i64,
    pub revoked: bool,
    pub created_at: i64,
}

/// Fields for a device row about to be created.
#[derive(Debug, Clone)]
pub struct NewDevice<'a> {
    pub id: &'a str,
    pub identity_data: &'a str,
    pub identity_struct: &'a str,
    pub identity_hash: &'a str,
    pub status: Status,
}

/// Fields for an auth set row about to be created.
#[derive(Debug, Clone)]
pub struct NewAuthSet<'a> {
    pub id: &'a str,
    pub device_id: &'a str,
    pub identity_data: &'a str,
    pub identity_struct: &'a str,
    pub identity_hash: &'a str,
    pub public_key: &'a str,
    pub status: Status,
}
