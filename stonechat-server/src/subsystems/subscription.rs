//! Webhook subscription lifecycle — reconcile against the remote backend
//! and keep the local record current.
//!
//! At most one subscription per webhook URL. The local row is replaced,
//! never appended: a re-created subscription gets a new remote id and the
//! old row's id must not survive it.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::broadcast;

use stonechat_core::auth::AuthManager;
use stonechat_core::config::SubscriptionConfig;
use stonechat_core::error::{AuthError, SubscriptionError};
use stonechat_core::models::Subscription;
use stonechat_core::ringcentral::{RcClient, RcError, SubscriptionInfo};
use stonechat_core::store::subscriptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Renewed,
}

pub struct SubscriptionManager {
    pool: PgPool,
    client: RcClient,
    auth: Arc<AuthManager>,
    config: SubscriptionConfig,
}

impl SubscriptionManager {
    pub fn new(
        pool: PgPool,
        client: RcClient,
        auth: Arc<AuthManager>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            pool,
            client,
            auth,
            config,
        }
    }

    /// The local subscription record for the configured webhook URL.
    pub async fn current(&self) -> Result<Subscription, SubscriptionError> {
        subscriptions::get(&self.pool, &self.config.webhook_url)
            .await?
            .ok_or_else(|| SubscriptionError::NotFound(self.config.webhook_url.clone()))
    }

    /// Reconcile remote state with the configured subscription:
    /// - remote subscription for our URL with matching filters: renew it
    /// - renewal rejected or subscription gone: delete and recreate
    /// - filters drifted or nothing remote: recreate
    /// The local row is replaced with whatever the backend confirmed.
    pub async fn ensure(&self) -> Result<EnsureOutcome, SubscriptionError> {
        let token = self.auth.access_token().await.map_err(map_auth)?;

        let remote = self
            .client
            .list_subscriptions(&token)
            .await
            .map_err(map_rc)?;

        let existing = remote.into_iter().find(|s| {
            s.delivery_mode
                .as_ref()
                .and_then(|d| d.address.as_deref())
                == Some(self.config.webhook_url.as_str())
        });

        match existing {
            Some(sub) if sub.event_filters == self.config.event_filters => {
                match self.client.renew_subscription(&token, &sub.id).await {
                    Ok(renewed) => {
                        self.store(&renewed).await?;
                        tracing::info!(
                            subscription = %renewed.id,
                            expires_at = %renewed.expiration_time,
                            "subscription renewed"
                        );
                        Ok(EnsureOutcome::Renewed)
                    }
                    Err(RcError::Api { code, message }) if (400..500).contains(&code) => {
                        tracing::warn!(
                            subscription = %sub.id,
                            code,
                            message = %message,
                            "renewal rejected, recreating subscription"
                        );
                        self.delete_remote(&token, &sub.id).await;
                        self.create(&token).await
                    }
                    Err(e) => Err(map_rc(e)),
                }
            }
            Some(sub) => {
                tracing::warn!(
                    subscription = %sub.id,
                    "event filters drifted from configuration, recreating subscription"
                );
                self.delete_remote(&token, &sub.id).await;
                self.create(&token).await
            }
            None => self.create(&token).await,
        }
    }

    async fn create(&self, token: &str) -> Result<EnsureOutcome, SubscriptionError> {
        let sub = self
            .client
            .create_subscription(
                token,
                &self.config.event_filters,
                &self.config.webhook_url,
                self.config.expires_in_secs,
            )
            .await
            .map_err(map_rc)?;

        self.store(&sub).await?;

        tracing::info!(
            subscription = %sub.id,
            expires_at = %sub.expiration_time,
            "subscription created"
        );

        Ok(EnsureOutcome::Created)
    }

    async fn store(&self, sub: &SubscriptionInfo) -> Result<(), SubscriptionError> {
        subscriptions::replace(
            &self.pool,
            &sub.id,
            &self.config.webhook_url,
            &sub.event_filters,
            sub.expiration_time,
        )
        .await?;
        Ok(())
    }

    /// Best-effort remote delete ahead of a recreate. A failure here leaves
    /// an orphan the next reconcile will not match, so it is logged and
    /// tolerated rather than aborting the recreate.
    async fn delete_remote(&self, token: &str, id: &str) {
        if let Err(e) = self.client.delete_subscription(token, id).await {
            tracing::warn!(subscription = %id, error = %e, "stale subscription delete failed");
        }
    }
}

/// Renewal loop. The first tick fires immediately, so startup reconciles
/// the subscription before the first full interval elapses.
pub async fn run_renewal_loop(
    manager: Arc<SubscriptionManager>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = Duration::from_secs(manager.config.renew_interval_hours * 3600);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_hours = manager.config.renew_interval_hours,
        "subscription renewal loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.ensure().await {
                    Ok(outcome) => {
                        tracing::debug!(?outcome, "subscription reconcile complete");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "subscription reconcile failed");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("subscription renewal loop shutting down");
                break;
            }
        }
    }
}

fn map_auth(e: AuthError) -> SubscriptionError {
    match e {
        AuthError::Transient(msg) => SubscriptionError::Transient(msg),
        other => SubscriptionError::Rejected {
            code: 401,
            message: other.to_string(),
        },
    }
}

fn map_rc(e: RcError) -> SubscriptionError {
    match e {
        RcError::Api { code, message } if code == 429 || code >= 500 => {
            SubscriptionError::Transient(format!("{code}: {message}"))
        }
        RcError::Api { code, message } => SubscriptionError::Rejected { code, message },
        RcError::Http(e) => SubscriptionError::Transient(e.to_string()),
        other => SubscriptionError::Rejected {
            code: 401,
            message: other.to_string(),
        },
    }
}
