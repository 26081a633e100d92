use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct StonechatConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub ringcentral: RingCentralConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Remote backend credentials and token policy.
///
/// `auth_mode` selects the grant used to obtain the first token:
/// - `"jwt"` — exchange the long-lived `jwt_assertion` (JWT-bearer grant)
/// - `"oauth"` — exchange `authorization_code` once, refresh tokens thereafter
///
/// `client_secret` and `jwt_assertion` may be left empty in the TOML and
/// supplied via `RINGCENTRAL_CLIENT_SECRET` / `RINGCENTRAL_JWT` instead.
#[derive(Debug, Deserialize, Clone)]
pub struct RingCentralConfig {
    pub server_url: String,
    pub auth_mode: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub jwt_assertion: String,
    #[serde(default)]
    pub authorization_code: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_refresh_margin() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

impl RingCentralConfig {
    /// Resolve secrets, preferring the environment over the TOML file so the
    /// config file can be committed without credentials.
    pub fn resolve_secrets(&mut self) {
        if let Ok(secret) = std::env::var("RINGCENTRAL_CLIENT_SECRET") {
            self.client_secret = secret;
        }
        if let Ok(assertion) = std::env::var("RINGCENTRAL_JWT") {
            self.jwt_assertion = assertion;
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    pub relay_marker: String,
    pub poll_limit: u32,
    pub max_message_len: usize,
    pub idle_after_secs: u64,
    pub close_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub webhook_budget_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            relay_marker: "[stonechat]".to_string(),
            poll_limit: 50,
            max_message_len: 4000,
            idle_after_secs: 900,
            close_after_secs: 7200,
            sweep_interval_secs: 60,
            webhook_budget_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionConfig {
    pub webhook_url: String,
    #[serde(default = "default_event_filters")]
    pub event_filters: Vec<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in_secs: u64,
    #[serde(default = "default_renew_interval")]
    pub renew_interval_hours: u64,
    #[serde(default)]
    pub verification_token: Option<String>,
}

fn default_event_filters() -> Vec<String> {
    vec!["/restapi/v1.0/glip/posts".to_string()]
}

fn default_expires_in() -> u64 {
    // 7 days; the daily renewal loop extends it long before expiry
    604_800
}

fn default_renew_interval() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8790,
        }
    }
}

impl StonechatConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        let mut cfg: Self = s.try_deserialize()?;
        cfg.ringcentral.resolve_secrets();
        Ok(cfg)
    }
}
