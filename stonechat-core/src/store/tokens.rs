//! Token store — one row per credential set, overwritten in place.

use sqlx::PgPool;

use crate::models::StoredToken;

pub async fn get(pool: &PgPool, credential_key: &str) -> Result<Option<StoredToken>, sqlx::Error> {
    sqlx::query_as::<_, StoredToken>("SELECT * FROM auth_tokens WHERE credential_key = $1")
        .bind(credential_key)
        .fetch_optional(pool)
        .await
}

pub async fn put(pool: &PgPool, token: &StoredToken) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO auth_tokens (credential_key, access_token, refresh_token, token_type, expires_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, now())
        ON CONFLICT (credential_key) DO UPDATE SET
            access_token  = EXCLUDED.access_token,
            refresh_token = EXCLUDED.refresh_token,
            token_type    = EXCLUDED.token_type,
            expires_at    = EXCLUDED.expires_at,
            updated_at    = now()
        "#,
    )
    .bind(&token.credential_key)
    .bind(&token.access_token)
    .bind(&token.refresh_token)
    .bind(&token.token_type)
    .bind(token.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop a credential's token row, forcing a full re-auth on next use.
pub async fn delete(pool: &PgPool, credential_key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM auth_tokens WHERE credential_key = $1")
        .bind(credential_key)
        .execute(pool)
        .await?;
    Ok(())
}
