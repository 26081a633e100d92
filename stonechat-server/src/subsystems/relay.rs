//! Message relay — visitor messages into the remote team-messaging chat.
//!
//! Ordering per message: store locally first (durable, visible to polling),
//! then forward. A forward failure marks the row `failed` and is reported in
//! the outcome, never as a request error: the visitor already got their
//! message into the log.
//!
//! Loop prevention, first line: on successful forward the remote post id is
//! written back onto the local visitor row, so the webhook echo of our own
//! post collides with the dedup key. The relay marker on the outbound text
//! is the second line, for posts whose write-back never happened.

use std::sync::Arc;

use sqlx::PgPool;

use stonechat_core::auth::AuthManager;
use stonechat_core::config::ChatConfig;
use stonechat_core::error::RelayError;
use stonechat_core::models::{SenderType, VisitorInfo};
use stonechat_core::ringcentral::{PostInfo, RcClient, RcError};
use stonechat_core::store::sessions::{self, LinkError, UpsertOutcome};
use stonechat_core::store::messages;

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: i64,
    pub session_created: bool,
    pub delivered: bool,
}

pub struct MessageRelay {
    pool: PgPool,
    client: RcClient,
    auth: Arc<AuthManager>,
    chat: ChatConfig,
}

impl MessageRelay {
    pub fn new(pool: PgPool, client: RcClient, auth: Arc<AuthManager>, chat: ChatConfig) -> Self {
        Self {
            pool,
            client,
            auth,
            chat,
        }
    }

    /// Accept a visitor message: upsert the session, append the message to
    /// the local log, then forward to the remote chat. Only local store
    /// failures are errors; the forward result is carried in the outcome.
    pub async fn send_message(
        &self,
        session_key: &str,
        visitor: &VisitorInfo,
        content: &str,
    ) -> Result<SendOutcome, RelayError> {
        let upsert = sessions::upsert_session(&self.pool, session_key, visitor).await?;
        let session_created = upsert == UpsertOutcome::Created;

        let message_id =
            messages::append(&self.pool, session_key, SenderType::Visitor, content, None).await?;

        let delivered = match self.forward(session_key, visitor, content).await {
            Ok(post) => {
                messages::mark_forwarded(&self.pool, message_id, &post.id).await?;
                tracing::debug!(
                    session = %session_key,
                    post = %post.id,
                    "visitor message forwarded"
                );
                true
            }
            Err(RelayError::LocalStore(e)) => return Err(RelayError::LocalStore(e)),
            Err(e) => {
                messages::mark_failed(&self.pool, message_id).await?;
                tracing::warn!(
                    session = %session_key,
                    message_id,
                    error = %e,
                    "forward failed, message stored locally"
                );
                false
            }
        };

        Ok(SendOutcome {
            message_id,
            session_created,
            delivered,
        })
    }

    async fn forward(
        &self,
        session_key: &str,
        visitor: &VisitorInfo,
        content: &str,
    ) -> Result<PostInfo, RelayError> {
        let chat_id = self.ensure_chat(session_key, visitor).await?;

        let token = self
            .auth
            .access_token()
            .await
            .map_err(|e| RelayError::RemoteForward(e.to_string()))?;

        let text = self.compose(visitor, content);

        match self.client.post_message(&token, &chat_id, &text).await {
            Ok(post) => Ok(post),
            Err(RcError::Api { code: 401, .. }) => {
                // The store thought the token was valid; the backend
                // disagreed. One forced refresh, one more attempt.
                let token = self
                    .auth
                    .force_refresh()
                    .await
                    .map_err(|e| RelayError::RemoteForward(e.to_string()))?;
                self.client
                    .post_message(&token, &chat_id, &text)
                    .await
                    .map_err(|e| RelayError::RemoteForward(e.to_string()))
            }
            Err(e) => Err(RelayError::RemoteForward(e.to_string())),
        }
    }

    /// Resolve the session's remote chat, creating and linking a team on
    /// first contact. A concurrent sender can win the link race; the loser
    /// adopts the winner's chat id.
    async fn ensure_chat(
        &self,
        session_key: &str,
        visitor: &VisitorInfo,
    ) -> Result<String, RelayError> {
        let session = sessions::get(&self.pool, session_key)
            .await?
            .ok_or_else(|| {
                RelayError::RemoteForward(format!("session {session_key} not found"))
            })?;

        if let Some(chat_id) = session.external_chat_id {
            return Ok(chat_id);
        }

        let token = self
            .auth
            .access_token()
            .await
            .map_err(|e| RelayError::RemoteForward(e.to_string()))?;

        let team_name = self.team_name(session_key, visitor);
        let team = self
            .client
            .create_team(&token, &team_name)
            .await
            .map_err(|e| RelayError::RemoteForward(e.to_string()))?;

        match sessions::link_external_chat(&self.pool, session_key, &team.id).await {
            Ok(()) => {
                tracing::info!(
                    session = %session_key,
                    chat = %team.id,
                    "remote chat created and linked"
                );
                Ok(team.id)
            }
            Err(LinkError::Conflict { existing, .. }) => {
                tracing::warn!(
                    session = %session_key,
                    winner = %existing,
                    orphaned = %team.id,
                    "lost chat-creation race, adopting existing link"
                );
                Ok(existing)
            }
            Err(LinkError::NotFound(key)) => {
                Err(RelayError::RemoteForward(format!("session {key} vanished")))
            }
            Err(LinkError::Db(e)) => Err(RelayError::LocalStore(e)),
        }
    }

    fn team_name(&self, session_key: &str, visitor: &VisitorInfo) -> String {
        match visitor.name.as_deref() {
            Some(name) if !name.trim().is_empty() => format!("Website chat: {name}"),
            _ => format!("Website chat: {session_key}"),
        }
    }

    fn compose(&self, visitor: &VisitorInfo, content: &str) -> String {
        let who = visitor.name.as_deref().unwrap_or("Visitor");
        format!("{} {}: {}", self.chat.relay_marker, who, content)
    }
}
