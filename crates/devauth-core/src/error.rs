//! Error types for devauth core library.

use thiserror::Error;

/// Result type alias using devauth core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for devauth operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
