//! Session lifecycle sweep. Periodically demotes quiet sessions to idle and
//! closes the ones nobody has touched in hours. Both transitions are driven
//! purely by timestamps, so a missed tick is recovered by the next one.

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};

use stonechat_core::config::ChatConfig;
use stonechat_core::store::sessions;

pub async fn run_sweep_loop(pool: PgPool, chat: ChatConfig, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(Duration::from_secs(chat.sweep_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = chat.sweep_interval_secs,
        idle_after_secs = chat.idle_after_secs,
        close_after_secs = chat.close_after_secs,
        "session sweep loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&pool, &chat).await;
            }
            _ = shutdown.recv() => {
                tracing::info!("session sweep loop shutting down");
                break;
            }
        }
    }
}

async fn sweep_once(pool: &PgPool, chat: &ChatConfig) {
    match sessions::mark_idle(pool, chat.idle_after_secs).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "sessions marked idle"),
        Err(e) => tracing::error!(error = %e, "idle sweep failed"),
    }

    match sessions::close_stale(pool, chat.close_after_secs).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "stale sessions closed"),
        Err(e) => tracing::error!(error = %e, "stale-close sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stonechat_core::db::run_migrations;
    use stonechat_core::models::{SessionStatus, VisitorInfo};
    use stonechat_core::store::sessions;

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        run_migrations(&pool).await.ok()?;
        Some(pool)
    }

    #[tokio::test]
    async fn test_sweep_once_transitions_untouched_sessions() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test_sweep_once_transitions_untouched_sessions: DATABASE_URL not set");
            return;
        };

        let key = format!("sweep-{}", uuid::Uuid::new_v4());
        let visitor = VisitorInfo {
            name: None,
            email: None,
            phone: None,
        };
        sessions::upsert_session(&pool, &key, &visitor)
            .await
            .expect("upsert");

        // Fresh session survives a sweep with generous cutoffs.
        let chat = ChatConfig {
            idle_after_secs: 3600,
            close_after_secs: 7200,
            ..ChatConfig::default()
        };
        sweep_once(&pool, &chat).await;
        let session = sessions::get(&pool, &key).await.expect("get").expect("row");
        assert_eq!(session.status, SessionStatus::Active);

        // Zero cutoffs make everything stale immediately.
        let chat = ChatConfig {
            idle_after_secs: 0,
            close_after_secs: 0,
            ..ChatConfig::default()
        };
        sweep_once(&pool, &chat).await;
        let session = sessions::get(&pool, &key).await.expect("get").expect("row");
        assert_eq!(session.status, SessionStatus::Closed);
    }
}
