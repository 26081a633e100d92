pub mod messages;
pub mod sessions;
pub mod subscriptions;
pub mod tokens;
