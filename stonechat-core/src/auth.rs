//! Token lifecycle — hands out a valid bearer token, refreshing through the
//! token endpoint when the stored one is inside its expiry margin.
//!
//! Refresh is single-flight: concurrent callers serialize on a mutex and the
//! winner's freshly stored token satisfies the waiters, so a burst of traffic
//! against an expired token produces exactly one token-endpoint round trip.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::config::RingCentralConfig;
use crate::error::AuthError;
use crate::models::StoredToken;
use crate::ringcentral::{RcClient, RcError, TokenGrant, TokenResponse};
use crate::store::tokens;

const CREDENTIAL_KEY: &str = "ringcentral";

pub struct AuthManager {
    pool: PgPool,
    client: RcClient,
    config: RingCentralConfig,
    credential_key: String,
    refresh_lock: Mutex<()>,
}

impl AuthManager {
    pub fn new(pool: PgPool, client: RcClient, config: RingCentralConfig) -> Self {
        Self {
            pool,
            client,
            config,
            credential_key: CREDENTIAL_KEY.to_string(),
            refresh_lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn with_credential_key(mut self, key: &str) -> Self {
        self.credential_key = key.to_string();
        self
    }

    /// A bearer token valid for at least `refresh_margin_secs` more seconds.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let margin = self.config.refresh_margin_secs;

        if let Some(token) = tokens::get(&self.pool, &self.credential_key).await? {
            if token.valid_for(margin) {
                return Ok(token.access_token);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Re-check under the lock: a concurrent caller may have refreshed
        // while this one was queued.
        let stored = tokens::get(&self.pool, &self.credential_key).await?;
        if let Some(token) = &stored {
            if token.valid_for(margin) {
                return Ok(token.access_token.clone());
            }
        }

        let response = self.acquire(stored.as_ref()).await?;
        let token = self.persist(response).await?;

        tracing::info!(
            credential = %self.credential_key,
            expires_at = %token.expires_at,
            "bearer token refreshed"
        );

        Ok(token.access_token)
    }

    /// Drop the cached token and fetch a new one, regardless of expiry.
    /// Used when the remote API rejects a token the store still considers
    /// valid (revocation on the remote side).
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        let stored = tokens::get(&self.pool, &self.credential_key).await?;
        let response = self.acquire(stored.as_ref()).await?;
        let token = self.persist(response).await?;

        tracing::warn!(
            credential = %self.credential_key,
            "bearer token force-refreshed after remote rejection"
        );

        Ok(token.access_token)
    }

    /// Try the stored refresh token first; fall back to the configured
    /// primary grant when there is none or the refresh token itself is dead.
    async fn acquire(&self, stored: Option<&StoredToken>) -> Result<TokenResponse, AuthError> {
        if let Some(refresh) = stored.and_then(|t| t.refresh_token.as_deref()) {
            match self
                .client
                .request_token(TokenGrant::RefreshToken { token: refresh })
                .await
            {
                Ok(response) => return Ok(response),
                Err(RcError::OAuth { error, description }) if error == "invalid_grant" => {
                    tracing::warn!(
                        description = %description,
                        "refresh token rejected, falling back to primary grant"
                    );
                }
                Err(e) => return Err(classify(e)),
            }
        }

        let grant = match self.config.auth_mode.as_str() {
            "jwt" => {
                if self.config.jwt_assertion.is_empty() {
                    return Err(AuthError::Config(
                        "auth_mode is jwt but no jwt_assertion configured".to_string(),
                    ));
                }
                TokenGrant::JwtBearer {
                    assertion: &self.config.jwt_assertion,
                }
            }
            "oauth" => {
                if self.config.authorization_code.is_empty() {
                    return Err(AuthError::ExpiredCredential(
                        "no usable refresh token and no authorization code to exchange"
                            .to_string(),
                    ));
                }
                TokenGrant::AuthorizationCode {
                    code: &self.config.authorization_code,
                    redirect_uri: &self.config.redirect_uri,
                }
            }
            other => {
                return Err(AuthError::Config(format!("unknown auth_mode: {other}")));
            }
        };

        self.client.request_token(grant).await.map_err(classify)
    }

    async fn persist(&self, response: TokenResponse) -> Result<StoredToken, AuthError> {
        let token = StoredToken {
            credential_key: self.credential_key.clone(),
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type,
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
            updated_at: Utc::now(),
        };

        tokens::put(&self.pool, &token).await?;
        Ok(token)
    }
}

/// Map a token-endpoint failure onto the auth taxonomy. `invalid_grant`
/// means the credential itself is dead; client-identity rejections and
/// malformed config are operator problems; the rest is weather.
fn classify(e: RcError) -> AuthError {
    match e {
        RcError::OAuth { error, description } => match error.as_str() {
            "invalid_grant" => AuthError::ExpiredCredential(description),
            _ => AuthError::Config(format!("{error}: {description}")),
        },
        RcError::Api { code, message } if code == 429 || code >= 500 => {
            AuthError::Transient(format!("{code}: {message}"))
        }
        RcError::Api { code, message } => AuthError::Config(format!("{code}: {message}")),
        RcError::Http(e) => AuthError::Transient(e.to_string()),
        RcError::MissingCredentials => AuthError::Config(e.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
