use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local record of the remote webhook subscription. Replaced, never
/// appended, on renewal; at most one row per webhook URL.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: String,
    pub webhook_url: String,
    pub event_filters: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
