//! devauth Server Library
//!
//! Trust core of the device authentication service:
//! - Identity canonicalization and hashing
//! - Auth set lifecycle and derived device status
//! - RS256 token issuance and validation
//! - Versioned data migrations over the device store
//! - `SQLite` storage, one database per tenant

pub mod auth;
pub mod devices;
pub mod identity;
pub mod migrate;
pub mod service;
pub mod storage;
