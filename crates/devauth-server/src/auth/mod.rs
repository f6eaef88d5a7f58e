//! Token agent: RS256 device tokens bound to a device ID.
//!
//! Issuance and validation only; revocation by `jti` is checked by the
//! caller against the token store.

pub mod claims;
pub mod jwt;
pub mod keys;

pub use claims::Claims;
pub use jwt::{Token, TokenAgent, TokenAgentConfig, TokenError};
pub use keys::{KeyError, SigningKey, load_private_key};
