//! Issued token queries (revocation store).

use devauth_core::db::unix_timestamp;

use super::db::{DatabaseError, DeviceDatabase};
use super::models::IssuedToken;

impl DeviceDatabase {
    /// Record an issued token, provided the device may still hold one.
    ///
    /// The eligibility check and the insert are a single statement, so a
    /// concurrent decision or decommission either lands first and blocks the
    /// insert, or lands after it and revokes the new row. With `auth_set_id`
    /// the token is tied to that auth set being the device's accepted one;
    /// without it the device itself must be accepted. Returns `None` when the
    /// device is not eligible.
    pub async fn add_token(
        &self,
        jti: &str,
        device_id: &str,
        auth_set_id: Option<&str>,
        expires_at: i64,
    ) -> Result<Option<IssuedToken>, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO tokens (jti, device_id, expires_at, created_at)
             SELECT ?, d.id, ?, ? FROM devices d
             WHERE d.id = ? AND d.decommissioning = 0
               AND CASE WHEN ? IS NULL THEN d.status = 'accepted'
                   ELSE EXISTS (SELECT 1 FROM auth_sets a
                                WHERE a.id = ? AND a.device_id = d.id AND a.status = 'accepted')
                   END",
        )
        .bind(jti)
        .bind(expires_at)
        .bind(now)
        .bind(device_id)
        .bind(auth_set_id)
        .bind(auth_set_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_token(jti).await.map(Some)
    }

    /// Get a token record by `jti`.
    pub async fn get_token(&self, jti: &str) -> Result<IssuedToken, DatabaseError> {
        sqlx::query_as::<_, IssuedToken>("SELECT * FROM tokens WHERE jti = ?")
            .bind(jti)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Token {jti}")))
    }

    /// Whether a `jti` must be refused. Tokens that were never recorded
    /// count as revoked.
    pub async fn is_token_revoked(&self, jti: &str) -> Result<bool, DatabaseError> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT revoked FROM tokens WHERE jti = ?")
            .bind(jti)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.is_none_or(|(revoked,)| revoked))
    }

    /// Revoke a token by `jti`.
    pub async fn revoke_token(&self, jti: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE tokens SET revoked = 1 WHERE jti = ? AND revoked = 0")
            .bind(jti)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Revoke every live token of a device.
    pub async fn revoke_device_tokens(&self, device_id: &str) -> Result<u64, DatabaseError> {
        let result =
            sqlx::query("UPDATE tokens SET revoked = 1 WHERE device_id = ? AND revoked = 0")
                .bind(device_id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected())
    }

    /// Drop records of tokens that expired before `now`. Their signatures no
    /// longer validate, so the revocation rows are dead weight.
    pub async fn delete_expired_tokens(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM tokens WHERE expires_at < ?")
            .bind(now)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }
}
