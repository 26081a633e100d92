use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sender_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Visitor,
    Agent,
    System,
}

/// Delivery state of a message. This service only moves visitor messages
/// `sent → delivered | failed`; `read` is set by the agent-side dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

/// One message in a session's append-only log. `id` is the widget's polling
/// cursor; rows are immutable apart from `status`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: i64,
    pub session_key: String,
    pub sender_type: SenderType,
    pub content: String,
    pub external_message_id: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}
