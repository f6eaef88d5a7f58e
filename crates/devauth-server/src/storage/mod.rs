//! `SQLite` storage for devauth.
//!
//! Provides persistence for devices, auth sets, issued tokens and the data
//! migration marker, one database per tenant.

mod db;
mod models;
mod queries;
mod queries_tokens;
mod tenant;


pub use db::{DatabaseError, DeviceDatabase};
pub use models::*;
pub use queries::write_migration_version;
pub use tenant::{TenantDatabases, TenantId, database_file};
