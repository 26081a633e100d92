//! RingCentral REST client — OAuth token grants, team-messaging posts,
//! and webhook subscription management.
//!
//! Endpoints covered:
//! - `POST /restapi/oauth/token` — jwt-bearer / authorization_code / refresh_token
//! - `POST /team-messaging/v1/teams`
//! - `POST /team-messaging/v1/chats/{chatId}/posts`
//! - `GET|POST /restapi/v1.0/subscription`, `POST .../{id}/renew`, `DELETE .../{id}`

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::RingCentralConfig;

const TOKEN_PATH: &str = "/restapi/oauth/token";
const SUBSCRIPTION_PATH: &str = "/restapi/v1.0/subscription";

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum RcError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("OAuth error ({error}): {description}")]
    OAuth { error: String, description: String },

    #[error("Missing client credentials")]
    MissingCredentials,
}

impl RcError {
    /// Retryable failures: network-level trouble and server-side errors.
    /// OAuth rejections and 4xx responses will not improve on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            RcError::Http(e) => e.is_timeout() || e.is_connect(),
            RcError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Wire structs
// ============================================================================

/// Grant presented to the token endpoint.
#[derive(Debug, Clone, Copy)]
pub enum TokenGrant<'a> {
    JwtBearer { assertion: &'a str },
    AuthorizationCode { code: &'a str, redirect_uri: &'a str },
    RefreshToken { token: &'a str },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamInfo {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostInfo {
    pub id: String,
    pub chat_id: Option<String>,
    pub text: Option<String>,
    pub creator_id: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: String,
    pub event_filters: Vec<String>,
    pub expiration_time: DateTime<Utc>,
    pub delivery_mode: Option<DeliveryMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMode {
    pub transport_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateTeamRequest {
    public: bool,
    name: String,
}

#[derive(Debug, Serialize)]
struct CreatePostRequest {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionRequest {
    event_filters: Vec<String>,
    delivery_mode: DeliveryMode,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SubscriptionList {
    records: Vec<SubscriptionInfo>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    error_code: Option<String>,
    message: Option<String>,
}

// ============================================================================
// RcClient
// ============================================================================

/// Thin client over the RingCentral REST API. Holds no token state; callers
/// pass the access token per request (the auth layer owns token lifecycle).
#[derive(Debug, Clone)]
pub struct RcClient {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl RcClient {
    pub fn new(config: &RingCentralConfig) -> Result<Self, RcError> {
        Self::with_base_url(config, config.server_url.clone())
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(
        config: &RingCentralConfig,
        base_url: String,
    ) -> Result<Self, RcError> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(RcError::MissingCredentials);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            max_retries: 3,
            retry_delay_ms: 500,
        })
    }

    /// Override the retry policy (tests shorten the delays).
    pub fn with_retry_policy(mut self, max_retries: usize, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    async fn retry_transient<T, F, Fut>(&self, op: F) -> Result<T, RcError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RcError>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(strategy, op, |e: &RcError| e.is_transient()).await
    }

    // ===== TOKEN ENDPOINT =====

    /// Exchange a grant for a bearer token. Transient failures are retried;
    /// OAuth rejections come back as [`RcError::OAuth`] with the server's
    /// error code intact so the auth layer can classify them.
    pub async fn request_token(&self, grant: TokenGrant<'_>) -> Result<TokenResponse, RcError> {
        self.retry_transient(|| self.request_token_once(grant)).await
    }

    async fn request_token_once(&self, grant: TokenGrant<'_>) -> Result<TokenResponse, RcError> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);

        let form: Vec<(&str, &str)> = match grant {
            TokenGrant::JwtBearer { assertion } => vec![
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion),
            ],
            TokenGrant::AuthorizationCode { code, redirect_uri } => vec![
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
            TokenGrant::RefreshToken { token } => vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", token),
            ],
        };

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        Ok(response.json().await?)
    }

    // ===== TEAM MESSAGING =====

    /// Create a private team for a chat session. Not retried: the caller
    /// treats any failure as a failed session bootstrap and surfaces it.
    pub async fn create_team(
        &self,
        access_token: &str,
        name: &str,
    ) -> Result<TeamInfo, RcError> {
        let url = format!("{}/team-messaging/v1/teams", self.base_url);

        let request = CreateTeamRequest {
            public: false,
            name: name.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        Ok(response.json().await?)
    }

    pub async fn post_message(
        &self,
        access_token: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<PostInfo, RcError> {
        self.retry_transient(|| self.post_message_once(access_token, chat_id, text))
            .await
    }

    async fn post_message_once(
        &self,
        access_token: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<PostInfo, RcError> {
        let url = format!("{}/team-messaging/v1/chats/{}/posts", self.base_url, chat_id);

        let request = CreatePostRequest {
            text: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        Ok(response.json().await?)
    }

    // ===== SUBSCRIPTIONS =====

    pub async fn list_subscriptions(
        &self,
        access_token: &str,
    ) -> Result<Vec<SubscriptionInfo>, RcError> {
        let url = format!("{}{}", self.base_url, SUBSCRIPTION_PATH);

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        let list: SubscriptionList = response.json().await?;
        Ok(list.records)
    }

    pub async fn create_subscription(
        &self,
        access_token: &str,
        event_filters: &[String],
        webhook_url: &str,
        expires_in_secs: u64,
    ) -> Result<SubscriptionInfo, RcError> {
        let url = format!("{}{}", self.base_url, SUBSCRIPTION_PATH);

        let request = CreateSubscriptionRequest {
            event_filters: event_filters.to_vec(),
            delivery_mode: DeliveryMode {
                transport_type: "WebHook".to_string(),
                address: Some(webhook_url.to_string()),
            },
            expires_in: expires_in_secs,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        Ok(response.json().await?)
    }

    pub async fn renew_subscription(
        &self,
        access_token: &str,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, RcError> {
        let url = format!(
            "{}{}/{}/renew",
            self.base_url, SUBSCRIPTION_PATH, subscription_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        Ok(response.json().await?)
    }

    pub async fn delete_subscription(
        &self,
        access_token: &str,
        subscription_id: &str,
    ) -> Result<(), RcError> {
        let url = format!("{}{}/{}", self.base_url, SUBSCRIPTION_PATH, subscription_id);

        let response = self
            .client
            .delete(&url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        Ok(())
    }
}

/// Decode an error response body. The token endpoint speaks RFC 6749
/// (`error` / `error_description`); the REST API speaks `errorCode` /
/// `message`. Anything else degrades to the raw status and body text.
async fn decode_error(response: reqwest::Response) -> RcError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    if let Ok(oauth) = serde_json::from_str::<OAuthErrorBody>(&body) {
        if let Some(error) = oauth.error {
            tracing::error!(code = status, error = %error, "token endpoint rejection");
            return RcError::OAuth {
                error,
                description: oauth.error_description.unwrap_or_default(),
            };
        }
    }

    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .and_then(|e| match (e.error_code, e.message) {
            (Some(code), Some(msg)) => Some(format!("{code}: {msg}")),
            (_, Some(msg)) => Some(msg),
            _ => None,
        })
        .unwrap_or(body);

    tracing::error!(code = status, message = %message, "RingCentral API error");

    RcError::Api {
        code: status,
        message,
    }
}

// ============================================================================
// TESTS
// ============================================================================
