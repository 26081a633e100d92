//! Stonechat HTTP API
//!
//! Axum-based HTTP server carrying both public faces of the relay: the
//! widget-facing chat endpoints and the backend-facing webhook receiver.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a
//! testable inner function returning `(StatusCode, serde_json::Value)`. The
//! webhook handler is the one exception, since the validation handshake
//! echoes a header rather than a body.
//!
//! Endpoints:
//! - GET  /health              — health check with DB status
//! - GET  /version             — server version info
//! - POST /send_message        — visitor message in, relayed to the remote chat
//! - GET  /get_messages        — cursor poll over a session's message log
//! - POST /close_session       — visitor-initiated session close
//! - POST /webhook             — remote backend event deliveries
//! - GET  /subscription        — current recorded webhook subscription
//! - POST /subscription/ensure — reconcile the remote subscription now

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use stonechat_core::config::StonechatConfig;
use stonechat_core::error::{RelayError, SubscriptionError, ValidationError};
use stonechat_core::models::{SessionStatus, VisitorInfo};
use stonechat_core::store::{messages, sessions};

use crate::subsystems::relay::MessageRelay;
use crate::subsystems::subscription::SubscriptionManager;
use crate::subsystems::webhook::{IngestError, IngestOutcome, WebhookIngester};

const VALIDATION_TOKEN_HEADER: &str = "Validation-Token";
const VERIFICATION_TOKEN_HEADER: &str = "Verification-Token";

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub pool: PgPool,
    pub config: StonechatConfig,
    pub relay: MessageRelay,
    pub ingester: WebhookIngester,
    pub subscriptions: SubscriptionManager,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/send_message", post(send_message_handler))
        .route("/get_messages", get(get_messages_handler))
        .route("/close_session", post(close_session_handler))
        .route("/webhook", post(webhook_handler))
        .route("/subscription", get(subscription_handler))
        .route("/subscription/ensure", post(subscription_ensure_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Stonechat HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub session_id: Option<String>,
    pub message: Option<String>,
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    pub visitor_phone: Option<String>,
}

impl SendMessageRequest {
    fn visitor(&self) -> VisitorInfo {
        VisitorInfo {
            name: self.visitor_name.clone(),
            email: self.visitor_email.clone(),
            phone: self.visitor_phone.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GetMessagesQuery {
    pub session_id: Option<String>,
    pub last_message_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CloseSessionRequest {
    pub session_id: Option<String>,
}

fn error_body(msg: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "error": msg.into(),
        "status": "error",
    })
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — queries DB and returns (status_code, json_body).
pub async fn health_inner(pool: &PgPool) -> (StatusCode, serde_json::Value) {
    let pg_ver = match stonechat_core::db::health_check(pool).await {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "postgresql": pg_ver,
        }),
    )
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "stonechat/1",
    })
}

/// Inner send_message — validates the payload, then hands it to the relay.
/// Forward failures still return 200: the message is durable locally and the
/// outcome carries `delivered: false`.
pub async fn send_message_inner(
    relay: &MessageRelay,
    max_message_len: usize,
    req: SendMessageRequest,
) -> (StatusCode, serde_json::Value) {
    let session_key = match req.session_id.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("session_id field is required"),
            );
        }
    };

    let content = match req.message.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("message field is required"),
            );
        }
    };

    if content.chars().count() > max_message_len {
        return (
            StatusCode::BAD_REQUEST,
            error_body(format!("message exceeds {max_message_len} characters")),
        );
    }

    let visitor = req.visitor();

    match relay.send_message(&session_key, &visitor, &content).await {
        Ok(outcome) => (
            StatusCode::OK,
            serde_json::json!({
                "success": true,
                "message_id": outcome.message_id,
                "session_created": outcome.session_created,
                "delivered": outcome.delivered,
            }),
        ),
        Err(RelayError::LocalStore(e)) => {
            tracing::error!(session = %session_key, error = %e, "send_message store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("message could not be stored"),
            )
        }
        Err(e) => (StatusCode::BAD_GATEWAY, error_body(e.to_string())),
    }
}

/// Inner get_messages — cursor poll. Polling an idle session revives it;
/// polling a closed one reports the status so the widget can stop.
pub async fn get_messages_inner(
    pool: &PgPool,
    poll_limit: u32,
    params: GetMessagesQuery,
) -> (StatusCode, serde_json::Value) {
    let session_key = match params.session_id.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("session_id parameter is required"),
            );
        }
    };

    let session = match sessions::get(pool, &session_key).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("session not found"));
        }
        Err(e) => {
            tracing::error!(session = %session_key, error = %e, "session lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("session lookup failed"),
            );
        }
    };

    let session_status = if session.status == SessionStatus::Idle {
        if let Err(e) = sessions::revive_if_idle(pool, &session_key).await {
            tracing::warn!(session = %session_key, error = %e, "idle revival failed");
        }
        SessionStatus::Active
    } else {
        session.status
    };

    let after_id = params.last_message_id.unwrap_or(0);
    let rows = match messages::list_since(pool, &session_key, after_id, poll_limit as i64).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(session = %session_key, error = %e, "message poll failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("message poll failed"),
            );
        }
    };

    let messages: Vec<serde_json::Value> = rows
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "sender_type": m.sender_type,
                "message": m.content,
                "timestamp": m.created_at,
            })
        })
        .collect();

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "session_status": session_status,
            "count": messages.len(),
            "messages": messages,
            "server_timestamp": Utc::now(),
        }),
    )
}

/// Inner close_session — idempotent: closing an already-closed session is
/// still a success, only an unknown key is a 404.
pub async fn close_session_inner(
    pool: &PgPool,
    req: CloseSessionRequest,
) -> (StatusCode, serde_json::Value) {
    let session_key = match req.session_id.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("session_id field is required"),
            );
        }
    };

    match sessions::get(pool, &session_key).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("session not found"));
        }
        Err(e) => {
            tracing::error!(session = %session_key, error = %e, "session lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("session lookup failed"),
            );
        }
    }

    match sessions::close(pool, &session_key).await {
        Ok(transitioned) => {
            if transitioned {
                tracing::info!(session = %session_key, "session closed by visitor");
            }
            (StatusCode::OK, serde_json::json!({ "success": true }))
        }
        Err(e) => {
            tracing::error!(session = %session_key, error = %e, "session close failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("session close failed"),
            )
        }
    }
}

/// Inner webhook — verification, decode, and ingestion under a time budget.
/// Anything the ingester acknowledges comes back 200 so the backend stops
/// redelivering; store failures and budget overruns come back 5xx so it
/// retries.
pub async fn webhook_inner(
    ingester: &WebhookIngester,
    expected_verification: Option<&str>,
    budget_ms: u64,
    headers: &HeaderMap,
    body: &[u8],
) -> (StatusCode, serde_json::Value) {
    if let Some(expected) = expected_verification {
        let presented = headers
            .get(VERIFICATION_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            tracing::warn!("webhook delivery with missing or wrong verification token");
            return (
                StatusCode::UNAUTHORIZED,
                error_body("verification token mismatch"),
            );
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                error_body(format!("malformed webhook body: {e}")),
            );
        }
    };

    let processed = tokio::time::timeout(
        Duration::from_millis(budget_ms),
        ingester.process(payload),
    )
    .await;

    match processed {
        Ok(Ok(IngestOutcome::Stored {
            session_key,
            message_id,
        })) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "result": "stored",
                "session_id": session_key,
                "message_id": message_id,
            }),
        ),
        Ok(Ok(IngestOutcome::Duplicate {
            session_key,
            message_id,
        })) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "result": "duplicate",
                "session_id": session_key,
                "message_id": message_id,
            }),
        ),
        Ok(Ok(IngestOutcome::Ignored(reason))) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "result": "ignored",
                "reason": reason,
            }),
        ),
        Ok(Err(IngestError::Validation(ValidationError::MalformedPayload(e)))) => {
            (StatusCode::BAD_REQUEST, error_body(e))
        }
        Ok(Err(IngestError::Validation(ValidationError::UnknownEvent(event)))) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "result": "ignored",
                "reason": format!("event not subscribed: {event}"),
            }),
        ),
        Ok(Err(IngestError::Store(e))) => {
            tracing::error!(error = %e, "webhook ingestion store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("ingestion store failure"),
            )
        }
        Err(_) => {
            tracing::error!(budget_ms, "webhook ingestion exceeded budget");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                error_body("ingestion timed out"),
            )
        }
    }
}

/// Inner subscription lookup — the locally recorded subscription, or 404.
pub async fn subscription_inner(
    manager: &SubscriptionManager,
) -> (StatusCode, serde_json::Value) {
    match manager.current().await {
        Ok(sub) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "subscription": sub,
            }),
        ),
        Err(SubscriptionError::NotFound(url)) => (
            StatusCode::NOT_FOUND,
            error_body(format!("no subscription recorded for {url}")),
        ),
        Err(e) => {
            tracing::error!(error = %e, "subscription lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("subscription lookup failed"),
            )
        }
    }
}

/// Inner subscription reconcile — runs the create/renew decision immediately.
pub async fn subscription_ensure_inner(
    manager: &SubscriptionManager,
) -> (StatusCode, serde_json::Value) {
    match manager.ensure().await {
        Ok(outcome) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "outcome": format!("{outcome:?}").to_lowercase(),
            }),
        ),
        Err(SubscriptionError::Store(e)) => {
            tracing::error!(error = %e, "subscription store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("subscription store failure"),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "subscription reconcile failed");
            (StatusCode::BAD_GATEWAY, error_body(e.to_string()))
        }
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn send_message_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    let (status, body) =
        send_message_inner(&state.relay, state.config.chat.max_message_len, req).await;
    (status, Json(body))
}

pub async fn get_messages_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<GetMessagesQuery>,
) -> impl IntoResponse {
    let (status, body) = get_messages_inner(&state.pool, state.config.chat.poll_limit, params).await;
    (status, Json(body))
}

pub async fn close_session_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<CloseSessionRequest>,
) -> impl IntoResponse {
    let (status, body) = close_session_inner(&state.pool, req).await;
    (status, Json(body))
}

/// The validation handshake is answered before anything else: the backend
/// sends an empty probe carrying `Validation-Token` and expects the same
/// header echoed back verbatim on an empty 200.
pub async fn webhook_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(token) = headers.get(VALIDATION_TOKEN_HEADER) {
        tracing::info!("webhook validation handshake answered");
        let mut response = StatusCode::OK.into_response();
        response
            .headers_mut()
            .insert(VALIDATION_TOKEN_HEADER, token.clone());
        return response;
    }

    let (status, body) = webhook_inner(
        &state.ingester,
        state.config.subscription.verification_token.as_deref(),
        state.config.chat.webhook_budget_ms,
        &headers,
        &body,
    )
    .await;
    (status, Json(body)).into_response()
}

pub async fn subscription_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = subscription_inner(&state.subscriptions).await;
    (status, Json(body))
}

pub async fn subscription_ensure_handler(
    State(state): State<Arc<HttpState>>,
) -> impl IntoResponse {
    let (status, body) = subscription_ensure_inner(&state.subscriptions).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests — pure validation paths that need neither DB nor backend
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string(), "version must be string");
        assert_eq!(v["protocol"], "stonechat/1");
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body("boom");
        assert_eq!(body["status"], "error");
        assert_eq!(body["error"], "boom");
    }

    #[test]
    fn test_send_message_request_visitor_fields() {
        let req = SendMessageRequest {
            session_id: Some("s-1".to_string()),
            message: Some("hi".to_string()),
            visitor_name: Some("Dana".to_string()),
            visitor_email: None,
            visitor_phone: Some("555-0101".to_string()),
        };
        let visitor = req.visitor();
        assert_eq!(visitor.name.as_deref(), Some("Dana"));
        assert!(visitor.email.is_none());
        assert_eq!(visitor.phone.as_deref(), Some("555-0101"));
    }
}
