//! Device authentication service.
//!
//! Glues the auth set state engine, the token agent and the revocation
//! store: tokens are only issued to accepted, active devices presenting
//! their accepted key, and leaving `accepted` revokes what was issued.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::auth::{Claims, Token, TokenAgent, TokenError};
use crate::devices::{Decision, DecisionOutcome, DeviceAuthEngine, DeviceError};
use crate::storage::{AuthSet, DatabaseError, Device, DeviceDatabase, Status};

/// Errors from the device authentication service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Device {device_id} is not authorized (status: {status})")]
    Unauthorized { device_id: String, status: Status },

    #[error("Device {0} is being decommissioned")]
    Decommissioning(String),

    #[error("Token revoked")]
    TokenRevoked,
}

/// Result of [`DevAuthService::authenticate`].
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub auth_set: AuthSet,
    pub token: Token,
}

pub struct DevAuthService {
    engine: DeviceAuthEngine,
    agent: Arc<TokenAgent>,
}

impl DevAuthService {
    pub const fn new(db: DeviceDatabase, agent: Arc<TokenAgent>) -> Self {
        Self {
            engine: DeviceAuthEngine::new(db),
            agent,
        }
    }

    pub const fn engine(&self) -> &DeviceAuthEngine {
        &self.engine
    }

    fn db(&self) -> &DeviceDatabase {
        self.engine.db()
    }

    /// Handle an authentication request.
    ///
    /// The auth set is always recorded. A token is issued only when that
    /// auth set is the device's accepted one and the device is not being
    /// decommissioned.
    #[instrument(skip(self, identity_data, public_key))]
    pub async fn authenticate(
        &self,
        device_id: Option<&str>,
        identity_data: &str,
        public_key: &str,
    ) -> Result<Authenticated, ServiceError> {
        let auth_set = self
            .engine
            .submit_auth_set(device_id, identity_data, public_key)
            .await?;
        let device = self.engine.device(&auth_set.device_id).await?;

        if auth_set.status != Status::Accepted {
            warn!(
                device_id = %device.id,
                auth_set_id = %auth_set.id,
                auth_set_status = %auth_set.status,
                "Authentication refused"
            );
            return Err(ServiceError::Unauthorized {
                device_id: device.id,
                status: auth_set.status,
            });
        }

        let token = self.issue(&device, Some(&auth_set.id)).await?;
        Ok(Authenticated { auth_set, token })
    }

    /// Issue a token for an accepted device outside the authentication
    /// flow (operator use).
    #[instrument(skip(self))]
    pub async fn issue_token(&self, device_id: &str) -> Result<Token, ServiceError> {
        let device = self.engine.device(device_id).await?;
        if device.status != Status::Accepted {
            return Err(ServiceError::Unauthorized {
                device_id: device.id,
                status: device.status,
            });
        }
        self.issue(&device, None).await
    }

    /// Sign a token and record it. The device row read by the caller may be
    /// stale, so the store re-checks eligibility when recording.
    async fn issue(
        &self,
        device: &Device,
        auth_set_id: Option<&str>,
    ) -> Result<Token, ServiceError> {
        if device.decommissioning {
            return Err(ServiceError::Decommissioning(device.id.clone()));
        }

        let token = self.agent.generate_token(&device.id)?;
        let recorded = self
            .db()
            .add_token(&token.id, &device.id, auth_set_id, token.expires_at)
            .await?;

        if recorded.is_none() {
            let current = self.engine.device(&device.id).await?;
            warn!(
                device_id = %current.id,
                status = %current.status,
                decommissioning = current.decommissioning,
                "Token refused, device changed during issuance"
            );
            if current.decommissioning {
                return Err(ServiceError::Decommissioning(current.id));
            }
            let status = match auth_set_id {
                Some(id) => self.engine.auth_set(id).await?.status,
                None => current.status,
            };
            return Err(ServiceError::Unauthorized {
                device_id: current.id,
                status,
            });
        }

        info!(device_id = %device.id, jti = %token.id, "Token issued");
        Ok(token)
    }

    /// Validate a token and check it has not been revoked.
    pub async fn verify(&self, token: &str) -> Result<Claims, ServiceError> {
        let claims = self.agent.validate_claims(token)?;
        if self.db().is_token_revoked(&claims.jti).await? {
            return Err(ServiceError::TokenRevoked);
        }
        Ok(claims)
    }

    /// Revoke a single token by `jti`.
    pub async fn revoke(&self, jti: &str) -> Result<bool, ServiceError> {
        Ok(self.db().revoke_token(jti).await?)
    }

    /// Decide an auth set. Moving an accepted auth set out of `accepted`
    /// revokes every token of its device.
    #[instrument(skip(self))]
    pub async fn decide(
        &self,
        auth_set_id: &str,
        decision: Decision,
    ) -> Result<DecisionOutcome, ServiceError> {
        let outcome = self.engine.decide_auth_set(auth_set_id, decision).await?;
        if outcome.revoke_tokens {
            let revoked = self.db().revoke_device_tokens(&outcome.device.id).await?;
            info!(device_id = %outcome.device.id, revoked, "Device tokens revoked");
        }
        Ok(outcome)
    }

    /// Flag a device for decommissioning and revoke its tokens.
    #[instrument(skip(self))]
    pub async fn decommission(&self, device_id: &str) -> Result<Device, ServiceError> {
        let device = self.engine.decommission_device(device_id).await?;
        let revoked = self.db().revoke_device_tokens(device_id).await?;
        info!(device_id, revoked, "Device tokens revoked");
        Ok(device)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::keys::parse_private_key_pem;

    const PRIVATE_KEY: &str = include_str!("../testdata/private.pem");
    const ID_1: &str = r#"{"sn":"0001","mac":"00:00:00:01"}"#;

    async fn test_service() -> DevAuthService {
        let key = parse_private_key_pem(PRIVATE_KEY.as_bytes()).unwrap();
        let agent = TokenAgent::with_key(key, "devauth-test".to_string(), 3600);
        let db = DeviceDatabase::open_in_memory().await.unwrap();
        DevAuthService::new(db, Arc::new(agent))
    }

    /// Submit `key` for the test identity and accept it.
    async fn accepted(service: &DevAuthService, key: &str) -> AuthSet {
        let err = service.authenticate(None, ID_1, key).await.unwrap_err();
        let device_id = match err {
            ServiceError::Unauthorized { device_id, status } => {
                assert_eq!(status, Status::Pending);
                device_id
            }
            other => panic!("unexpected error: {other}"),
        };

        let auth_set = service
            .engine()
            .list_auth_sets(&device_id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.public_key == key)
            .unwrap();
        service.decide(&auth_set.id, Decision::Accept).await.unwrap();
        auth_set
    }

    #[tokio::test]
    async fn accepted_device_gets_verifiable_token() {
        let service = test_service().await;
        let auth_set = accepted(&service, "KEY-1").await;

        let auth = service.authenticate(None, ID_1, "KEY-1").await.unwrap();
        assert_eq!(auth.auth_set.id, auth_set.id);
        assert_eq!(auth.token.subject, auth_set.device_id);

        let claims = service.verify(&auth.token.token).await.unwrap();
        assert_eq!(claims.jti, auth.token.id);
        assert_eq!(claims.sub, auth_set.device_id);
    }

    #[tokio::test]
    async fn other_key_of_accepted_device_is_refused() {
        let service = test_service().await;
        accepted(&service, "KEY-1").await;

        let err = service.authenticate(None, ID_1, "KEY-2").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn rejecting_accepted_auth_set_revokes_tokens() {
        let service = test_service().await;
        let auth_set = accepted(&service, "KEY-1").await;
        let auth = service.authenticate(None, ID_1, "KEY-1").await.unwrap();

        service.decide(&auth_set.id, Decision::Reject).await.unwrap();

        assert!(matches!(
            service.verify(&auth.token.token).await,
            Err(ServiceError::TokenRevoked)
        ));
        assert!(matches!(
            service.authenticate(None, ID_1, "KEY-1").await,
            Err(ServiceError::Unauthorized {
                status: Status::Rejected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn decommissioned_device_gets_no_tokens() {
        let service = test_service().await;
        let auth_set = accepted(&service, "KEY-1").await;
        let auth = service.authenticate(None, ID_1, "KEY-1").await.unwrap();

        service.decommission(&auth_set.device_id).await.unwrap();

        assert!(matches!(
            service.verify(&auth.token.token).await,
            Err(ServiceError::TokenRevoked)
        ));
        assert!(matches!(
            service.authenticate(None, ID_1, "KEY-1").await,
            Err(ServiceError::Decommissioning(_))
        ));
        assert!(matches!(
            service.issue_token(&auth_set.device_id).await,
            Err(ServiceError::Decommissioning(_))
        ));
    }

    #[tokio::test]
    async fn issue_token_requires_accepted_device() {
        let service = test_service().await;
        service.authenticate(Some("dev"), ID_1, "K").await.unwrap_err();

        assert!(matches!(
            service.issue_token("dev").await,
            Err(ServiceError::Unauthorized {
                status: Status::Pending,
                ..
            })
        ));
        assert!(matches!(
            service.issue_token("ghost").await,
            Err(ServiceError::Device(DeviceError::DeviceNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn revoked_jti_fails_verification() {
        let service = test_service().await;
        let auth_set = accepted(&service, "KEY-1").await;
        let token = service.issue_token(&auth_set.device_id).await.unwrap();

        assert!(service.verify(&token.token).await.is_ok());
        assert!(service.revoke(&token.id).await.unwrap());
        assert!(matches!(
            service.verify(&token.token).await,
            Err(ServiceError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn stale_accepted_read_issues_no_token_after_reject() {
        let service = test_service().await;
        let auth_set = accepted(&service, "KEY-1").await;
        let stale = service.engine().device(&auth_set.device_id).await.unwrap();
        assert_eq!(stale.status, Status::Accepted);

        // The reject lands between the status read and the token write.
        service.decide(&auth_set.id, Decision::Reject).await.unwrap();

        assert!(matches!(
            service.issue(&stale, Some(&auth_set.id)).await,
            Err(ServiceError::Unauthorized {
                status: Status::Rejected,
                ..
            })
        ));
        assert!(matches!(
            service.issue(&stale, None).await,
            Err(ServiceError::Unauthorized {
                status: Status::Rejected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn stale_read_issues_no_token_after_decommission() {
        let service = test_service().await;
        let auth_set = accepted(&service, "KEY-1").await;
        let stale = service.engine().device(&auth_set.device_id).await.unwrap();

        service.decommission(&auth_set.device_id).await.unwrap();

        assert!(matches!(
            service.issue(&stale, Some(&auth_set.id)).await,
            Err(ServiceError::Decommissioning(_))
        ));
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let service = test_service().await;
        assert!(matches!(
            service.verify("not-a-token").await,
            Err(ServiceError::Token(TokenError::Invalid(_)))
        ));
    }
}
