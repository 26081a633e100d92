//! Session store — CRUD over `chat_sessions`.
//!
//! All state-machine rules live in the SQL guards, not in callers:
//! - `external_chat_id` is written at most once; a conflicting relink fails
//!   without touching the row
//! - status only moves `active → idle → closed` / `active → closed`;
//!   `closed` is terminal

use chrono::{Duration, Utc};
use sqlx::PgPool;
use thiserror::Error;

use crate::models::{Session, VisitorInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("session {session} already linked to chat {existing}, refusing relink to {requested}")]
    Conflict {
        session: String,
        existing: String,
        requested: String,
    },

    #[error("session {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Create the session row if absent, otherwise merge any non-null visitor
/// fields and refresh `updated_at`. An `idle` session comes back `active`;
/// a `closed` one stays closed.
pub async fn upsert_session(
    pool: &PgPool,
    session_key: &str,
    visitor: &VisitorInfo,
) -> Result<UpsertOutcome, sqlx::Error> {
    // xmax = 0 only holds for freshly inserted rows, which distinguishes
    // the insert and update arms of the upsert in one round trip.
    let row: (bool,) = sqlx::query_as(
        r#"
        INSERT INTO chat_sessions (session_key, visitor_name, visitor_email, visitor_phone)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (session_key) DO UPDATE SET
            visitor_name  = COALESCE(EXCLUDED.visitor_name,  chat_sessions.visitor_name),
            visitor_email = COALESCE(EXCLUDED.visitor_email, chat_sessions.visitor_email),
            visitor_phone = COALESCE(EXCLUDED.visitor_phone, chat_sessions.visitor_phone),
            status = CASE WHEN chat_sessions.status = 'closed'
                          THEN chat_sessions.status
                          ELSE 'active'::session_status END,
            updated_at = now()
        RETURNING (xmax = 0)
        "#,
    )
    .bind(session_key)
    .bind(&visitor.name)
    .bind(&visitor.email)
    .bind(&visitor.phone)
    .fetch_one(pool)
    .await?;

    Ok(if row.0 {
        UpsertOutcome::Created
    } else {
        UpsertOutcome::Updated
    })
}

pub async fn get(pool: &PgPool, session_key: &str) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM chat_sessions WHERE session_key = $1")
        .bind(session_key)
        .fetch_optional(pool)
        .await
}

pub async fn find_by_external_chat(
    pool: &PgPool,
    external_chat_id: &str,
) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM chat_sessions WHERE external_chat_id = $1")
        .bind(external_chat_id)
        .fetch_optional(pool)
        .await
}

/// Record the remote conversation id for a session. Idempotent when the same
/// id is already linked; a different non-null id means the relay and webhook
/// paths got cross-wired, and the call fails without modifying the row.
pub async fn link_external_chat(
    pool: &PgPool,
    session_key: &str,
    external_chat_id: &str,
) -> Result<(), LinkError> {
    let result = sqlx::query(
        r#"
        UPDATE chat_sessions
        SET external_chat_id = $2, updated_at = now()
        WHERE session_key = $1
          AND (external_chat_id IS NULL OR external_chat_id = $2)
        "#,
    )
    .bind(session_key)
    .bind(external_chat_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    match get(pool, session_key).await? {
        Some(session) => {
            let existing = session.external_chat_id.unwrap_or_default();
            Err(LinkError::Conflict {
                session: session_key.to_string(),
                existing,
                requested: external_chat_id.to_string(),
            })
        }
        None => Err(LinkError::NotFound(session_key.to_string())),
    }
}

/// Close a session. Returns true if this call performed the transition,
/// false if the session was already closed or does not exist.
pub async fn close(pool: &PgPool, session_key: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE chat_sessions
        SET status = 'closed', closed_at = now(), updated_at = now()
        WHERE session_key = $1 AND status <> 'closed'
        "#,
    )
    .bind(session_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Poll-side revival: an `idle` session the visitor is still watching goes
/// back to `active`. No-op for `active` and `closed`.
pub async fn revive_if_idle(pool: &PgPool, session_key: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE chat_sessions SET status = 'active', updated_at = now() \
         WHERE session_key = $1 AND status = 'idle'",
    )
    .bind(session_key)
    .execute(pool)
    .await?;
    Ok(())
}

/// Sweep: demote active sessions with no traffic for `idle_after_secs`.
pub async fn mark_idle(pool: &PgPool, idle_after_secs: u64) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::seconds(idle_after_secs as i64);
    let result = sqlx::query(
        r#"
        UPDATE chat_sessions
        SET status = 'idle', updated_at = now()
        WHERE status = 'active' AND COALESCE(last_message_at, created_at) < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Sweep: close idle sessions abandoned for `close_after_secs`.
pub async fn close_stale(pool: &PgPool, close_after_secs: u64) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::seconds(close_after_secs as i64);
    let result = sqlx::query(
        r#"
        UPDATE chat_sessions
        SET status = 'closed', closed_at = now(), updated_at = now()
        WHERE status = 'idle' AND COALESCE(last_message_at, created_at) < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
