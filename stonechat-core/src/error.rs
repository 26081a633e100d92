use thiserror::Error;

#[derive(Error, Debug)]
pub enum StonechatError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Token acquisition failures.
///
/// The three remote variants are deliberately distinct: a `Config` error will
/// not self-heal and needs operator attention, `ExpiredCredential` means the
/// assertion/refresh token must be re-issued, `Transient` is retryable.
/// Callers and log output must not collapse them.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("auth configuration rejected by token endpoint: {0}")]
    Config(String),

    #[error("credential expired or revoked: {0}")]
    ExpiredCredential(String),

    #[error("transient token endpoint failure: {0}")]
    Transient(String),

    #[error("token store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Visitor message relay failures. Local store failures are fatal to the
/// request; remote forward failures are not (the message is already durable
/// and visible locally).
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("local message store failure: {0}")]
    LocalStore(#[from] sqlx::Error),

    #[error("remote forward failure: {0}")]
    RemoteForward(String),
}

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("no subscription recorded for {0}")]
    NotFound(String),

    #[error("subscription request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("transient subscription API failure: {0}")]
    Transient(String),

    #[error("subscription store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Webhook payload validation failures. `MalformedPayload` maps to an HTTP
/// error; `UnknownEvent` is acknowledged and dropped.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("event type not subscribed: {0}")]
    UnknownEvent(String),
}
