//! Webhook ingestion — agent posts from the remote backend into the local log.
//!
//! Delivery is at-least-once; every decision here has to be idempotent.
//! The order of the guards matters:
//! 1. event filter (only new-post events are subscribed)
//! 2. session lookup by remote chat id (unknown chat is an ack-and-drop)
//! 3. provenance: a local row already carrying this post id means either the
//!    echo of our own forward or a redelivery
//! 4. marker: echoes whose write-back never landed still carry the relay
//!    marker in their text
//! 5. append with the dedup key, which absorbs any race the guards missed

use serde::Deserialize;
use sqlx::PgPool;
use thiserror::Error;

use stonechat_core::config::ChatConfig;
use stonechat_core::error::ValidationError;
use stonechat_core::models::{SenderType, SessionStatus};
use stonechat_core::store::{messages, sessions};

const POST_EVENT_FILTER: &str = "/glip/posts";

#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub uuid: Option<String>,
    pub event: String,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEventBody {
    pub event_type: Option<String>,
    pub id: String,
    pub group_id: Option<String>,
    pub chat_id: Option<String>,
    pub text: Option<String>,
    pub creator_id: Option<String>,
}

impl PostEventBody {
    fn chat(&self) -> Option<&str> {
        self.group_id.as_deref().or(self.chat_id.as_deref())
    }
}

/// What happened to one delivery. Everything except `Stored` is an
/// acknowledged no-op; the backend must not redeliver any of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { session_key: String, message_id: i64 },
    Duplicate { session_key: String, message_id: i64 },
    Ignored(&'static str),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("message store failure: {0}")]
    Store(#[from] sqlx::Error),
}

pub struct WebhookIngester {
    pool: PgPool,
    chat: ChatConfig,
}

impl WebhookIngester {
    pub fn new(pool: PgPool, chat: ChatConfig) -> Self {
        Self { pool, chat }
    }

    pub async fn process(&self, payload: serde_json::Value) -> Result<IngestOutcome, IngestError> {
        let body = match parse_post_event(payload) {
            Ok(body) => body,
            Err(ValidationError::UnknownEvent(event)) => {
                tracing::debug!(event = %event, "unsubscribed event acknowledged and dropped");
                return Ok(IngestOutcome::Ignored("event not subscribed"));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(event_type) = &body.event_type {
            if event_type != "PostAdded" {
                return Ok(IngestOutcome::Ignored("not a new post"));
            }
        }

        let chat_id = body
            .chat()
            .ok_or_else(|| ValidationError::MalformedPayload("post event without chat id".to_string()))?
            .to_string();

        let Some(session) = sessions::find_by_external_chat(&self.pool, &chat_id).await? else {
            tracing::debug!(chat = %chat_id, "post for unlinked chat ignored");
            return Ok(IngestOutcome::Ignored("no session for chat"));
        };

        if session.status == SessionStatus::Closed {
            return Ok(IngestOutcome::Ignored("session closed"));
        }

        let Some(text) = body.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Ok(IngestOutcome::Ignored("post without text"));
        };

        if let Some(existing) =
            messages::find_by_external(&self.pool, &session.session_key, &body.id).await?
        {
            return Ok(match existing.sender_type {
                SenderType::Visitor => IngestOutcome::Ignored("echo of forwarded message"),
                _ => IngestOutcome::Duplicate {
                    session_key: session.session_key,
                    message_id: existing.id,
                },
            });
        }

        if text.starts_with(&self.chat.relay_marker) {
            tracing::debug!(
                session = %session.session_key,
                post = %body.id,
                "marker-bearing echo dropped without provenance row"
            );
            return Ok(IngestOutcome::Ignored("relay marker"));
        }

        let message_id = messages::append(
            &self.pool,
            &session.session_key,
            SenderType::Agent,
            text,
            Some(&body.id),
        )
        .await?;

        tracing::info!(
            session = %session.session_key,
            message_id,
            post = %body.id,
            "agent message ingested"
        );

        Ok(IngestOutcome::Stored {
            session_key: session.session_key,
            message_id,
        })
    }
}

/// Decode the delivery envelope and, for subscribed events, the post body.
fn parse_post_event(payload: serde_json::Value) -> Result<PostEventBody, ValidationError> {
    let envelope: WebhookEnvelope = serde_json::from_value(payload)
        .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;

    if !envelope.event.contains(POST_EVENT_FILTER) {
        return Err(ValidationError::UnknownEvent(envelope.event));
    }

    serde_json::from_value(envelope.body)
        .map_err(|e| ValidationError::MalformedPayload(e.to_string()))
}
