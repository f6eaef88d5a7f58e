//! devauth Core Library
//!
//! Shared functionality for devauth components:
//! - Configuration resolution (defaults, JSON file, environment)
//! - `SQLite` pool helpers and timestamps
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
