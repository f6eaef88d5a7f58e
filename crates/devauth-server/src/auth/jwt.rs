//! RS256 device token issuance and validation.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use devauth_core::config::TokenConfig;
use devauth_core::db::unix_timestamp;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Header, Validation};
use serde::Deserialize;
use tracing::info;

use super::claims::Claims;
use super::keys::{KeyError, SigningKey, load_private_key};

/// Header algorithms accepted for verification: the RSA signature family.
const RSA_ALGORITHMS: [Algorithm; 6] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// Errors from token issuance and validation.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Failed to create token: {0}")]
    SigningFailed(String),

    #[error("Unexpected signing method: {0}")]
    UnexpectedSigningMethod(String),

    #[error("Token expired")]
    Expired,

    #[error("Token invalid: {0}")]
    Invalid(String),
}

/// Token agent settings.
#[derive(Debug, Clone)]
pub struct TokenAgentConfig {
    pub private_key_path: PathBuf,
    /// Token lifetime in seconds.
    pub expiration_timeout_secs: i64,
    pub issuer: String,
}

impl From<&TokenConfig> for TokenAgentConfig {
    fn from(config: &TokenConfig) -> Self {
        Self {
            private_key_path: config.private_key_path.clone(),
            expiration_timeout_secs: config.expiration_timeout_secs,
            issuer: config.issuer.clone(),
        }
    }
}

/// A freshly issued token.
#[derive(Debug, Clone)]
pub struct Token {
    /// The `jti` claim.
    pub id: String,
    /// Device ID the token authorizes.
    pub subject: String,
    pub expires_at: i64,
    /// Signed compact JWT.
    pub token: String,
}

/// Signs and validates device tokens with the server RSA key.
///
/// Holds no mutable state; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct TokenAgent {
    key: SigningKey,
    issuer: String,
    expiration_timeout_secs: i64,
}

impl TokenAgent {
    /// Load the private key named in `config`.
    pub fn new(config: &TokenAgentConfig) -> Result<Self, KeyError> {
        let key = load_private_key(&config.private_key_path)?;
        info!(
            path = %config.private_key_path.display(),
            bits = key.bits(),
            issuer = %config.issuer,
            "Signing key loaded"
        );
        Ok(Self::with_key(
            key,
            config.issuer.clone(),
            config.expiration_timeout_secs,
        ))
    }

    pub const fn with_key(key: SigningKey, issuer: String, expiration_timeout_secs: i64) -> Self {
        Self {
            key,
            issuer,
            expiration_timeout_secs,
        }
    }

    /// Issue an RS256 token for `device_id` with a new random `jti`.
    pub fn generate_token(&self, device_id: &str) -> Result<Token, TokenError> {
        let jti = uuid::Uuid::new_v4().to_string();
        let exp = unix_timestamp()
            .checked_add(self.expiration_timeout_secs)
            .ok_or_else(|| {
                TokenError::SigningFailed(format!(
                    "expiration timeout {}s is out of range",
                    self.expiration_timeout_secs
                ))
            })?;

        let claims = Claims {
            iss: self.issuer.clone(),
            sub: device_id.to_string(),
            exp,
            jti: jti.clone(),
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            self.key.encoding_key(),
        )
        .map_err(|e| TokenError::SigningFailed(e.to_string()))?;

        Ok(Token {
            id: jti,
            subject: claims.sub,
            expires_at: exp,
            token,
        })
    }

    /// Verify a token and return its `jti`.
    pub fn validate_token(&self, token: &str) -> Result<String, TokenError> {
        self.validate_claims(token).map(|claims| claims.jti)
    }

    /// Verify a token and return all of its claims.
    ///
    /// Tokens whose header names a non-RSA algorithm are refused before any
    /// signature check.
    pub fn validate_claims(&self, token: &str) -> Result<Claims, TokenError> {
        let alg = header_algorithm(token)?;
        let mut validation = Validation::new(alg);
        validation.algorithms = RSA_ALGORITHMS.to_vec();
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        let data = jsonwebtoken::decode::<Claims>(token, self.key.decoding_key(), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidAlgorithm => {
                    TokenError::UnexpectedSigningMethod(format!("{alg:?}"))
                }
                _ => TokenError::Invalid(e.to_string()),
            })?;

        Ok(data.claims)
    }
}

/// The `alg` member of a JWT header, read as a plain string.
#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

/// Read the header's `alg` and require an RSA algorithm. Names the JWT
/// library does not model (`none`, `ES256K`, ...) are still reported as an
/// unexpected signing method.
fn header_algorithm(token: &str) -> Result<Algorithm, TokenError> {
    let segment = token.split_once('.').map_or(token, |(header, _)| header);
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::Invalid(format!("header is not base64url: {e}")))?;
    let header: RawHeader = serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::Invalid(format!("malformed header: {e}")))?;

    match header.alg.parse::<Algorithm>() {
        Ok(alg) if RSA_ALGORITHMS.contains(&alg) => Ok(alg),
        _ => Err(TokenError::UnexpectedSigningMethod(header.alg)),
    }
}
