//! Subscription store — at most one row per webhook URL, replaced on renewal.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::Subscription;

pub async fn get(pool: &PgPool, webhook_url: &str) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(
        "SELECT * FROM webhook_subscriptions WHERE webhook_url = $1",
    )
    .bind(webhook_url)
    .fetch_optional(pool)
    .await
}

/// Replace the local record for a webhook URL. The remote id changes on
/// re-creation, so the upsert keys on the URL and rewrites everything else.
pub async fn replace(
    pool: &PgPool,
    id: &str,
    webhook_url: &str,
    event_filters: &[String],
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO webhook_subscriptions (id, webhook_url, event_filters, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (webhook_url) DO UPDATE SET
            id            = EXCLUDED.id,
            event_filters = EXCLUDED.event_filters,
            expires_at    = EXCLUDED.expires_at,
            updated_at    = now()
        "#,
    )
    .bind(id)
    .bind(webhook_url)
    .bind(event_filters)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &PgPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}
