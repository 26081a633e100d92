pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod ringcentral;
pub mod store;

pub use auth::AuthManager;
pub use config::StonechatConfig;
pub use error::{AuthError, RelayError, StonechatError, SubscriptionError, ValidationError};
pub use ringcentral::{RcClient, RcError, TokenGrant};
