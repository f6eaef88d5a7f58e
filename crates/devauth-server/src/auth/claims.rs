//! JWT claims structure for device tokens.

use serde::{Deserialize, Serialize};

/// Claims embedded in a device access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    pub iss: String,
    /// Subject (device ID).
    pub sub: String,
    /// Expiration (unix timestamp).
    pub exp: i64,
    /// JWT ID, the revocation handle.
    pub jti: String,
}
