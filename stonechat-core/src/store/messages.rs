//! Message store — append-only log per session, polled by `id` cursor.
//!
//! Dedup is enforced by the partial unique index on
//! `(session_key, external_message_id)`: a webhook redelivery hits
//! `ON CONFLICT DO NOTHING` and the existing row id is returned instead,
//! without advancing `last_message_at`.

use sqlx::PgPool;

use crate::models::{ChatMessage, MessageStatus, SenderType};

/// Append a message to the session log and bump the session's
/// `last_message_at`. Returns the row id.
///
/// When `external_message_id` is set and a row with the same
/// `(session_key, external_message_id)` already exists, the insert is a
/// no-op and the existing id comes back; the session timestamps are left
/// alone since nothing new arrived.
pub async fn append(
    pool: &PgPool,
    session_key: &str,
    sender_type: SenderType,
    content: &str,
    external_message_id: Option<&str>,
) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO chat_messages (session_key, sender_type, content, external_message_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (session_key, external_message_id)
            WHERE external_message_id IS NOT NULL
            DO NOTHING
        RETURNING id
        "#,
    )
    .bind(session_key)
    .bind(sender_type)
    .bind(content)
    .bind(external_message_id)
    .fetch_optional(&mut *tx)
    .await?;

    let id = match inserted {
        Some((id,)) => {
            sqlx::query(
                "UPDATE chat_sessions SET last_message_at = now(), updated_at = now() \
                 WHERE session_key = $1",
            )
            .bind(session_key)
            .execute(&mut *tx)
            .await?;
            id
        }
        None => {
            // Dedup hit. external_message_id is necessarily Some here,
            // otherwise the insert could not have conflicted.
            let (id,): (i64,) = sqlx::query_as(
                "SELECT id FROM chat_messages \
                 WHERE session_key = $1 AND external_message_id = $2",
            )
            .bind(session_key)
            .bind(external_message_id)
            .fetch_one(&mut *tx)
            .await?;
            id
        }
    };

    tx.commit().await?;
    Ok(id)
}

/// Messages with `id` strictly greater than `after_id`, oldest first.
/// `id` is the polling cursor; insert order, not `created_at`, which can tie.
pub async fn list_since(
    pool: &PgPool,
    session_key: &str,
    after_id: i64,
    limit: i64,
) -> Result<Vec<ChatMessage>, sqlx::Error> {
    sqlx::query_as::<_, ChatMessage>(
        "SELECT * FROM chat_messages \
         WHERE session_key = $1 AND id > $2 \
         ORDER BY id ASC LIMIT $3",
    )
    .bind(session_key)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Record a successful forward: the remote post id lands on the local row
/// so the webhook echo of our own forward collides with the dedup index.
pub async fn mark_forwarded(
    pool: &PgPool,
    id: i64,
    external_post_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE chat_messages SET status = $2, external_message_id = $3 WHERE id = $1",
    )
    .bind(id)
    .bind(MessageStatus::Delivered)
    .bind(external_post_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &PgPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE chat_messages SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(MessageStatus::Failed)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_by_external(
    pool: &PgPool,
    session_key: &str,
    external_message_id: &str,
) -> Result<Option<ChatMessage>, sqlx::Error> {
    sqlx::query_as::<_, ChatMessage>(
        "SELECT * FROM chat_messages \
         WHERE session_key = $1 AND external_message_id = $2",
    )
    .bind(session_key)
    .bind(external_message_id)
    .fetch_optional(pool)
    .await
}
