//! HTTP integration tests for the Stonechat REST API.
//!
//! Pure validation paths run against a lazy pool and never touch Postgres;
//! the store-backed paths require a live database and skip gracefully when
//! DATABASE_URL is not set. Full-dispatch tests go through the Axum router
//! with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use stonechat_core::auth::AuthManager;
use stonechat_core::config::{
    ChatConfig, DatabaseConfig, HttpConfig, RingCentralConfig, ServiceConfig, StonechatConfig,
    SubscriptionConfig,
};
use stonechat_core::db::run_migrations;
use stonechat_core::models::{SenderType, VisitorInfo};
use stonechat_core::ringcentral::RcClient;
use stonechat_core::store::{messages, sessions};

use stonechat_server::http::{
    build_router, close_session_inner, get_messages_inner, health_inner, send_message_inner,
    CloseSessionRequest, GetMessagesQuery, HttpState, SendMessageRequest,
};
use stonechat_server::subsystems::relay::MessageRelay;
use stonechat_server::subsystems::subscription::SubscriptionManager;
use stonechat_server::subsystems::webhook::WebhookIngester;

// ===========================================================================
// Fixtures
// ===========================================================================

fn rc_config() -> RingCentralConfig {
    RingCentralConfig {
        server_url: "http://127.0.0.1:9".to_string(),
        auth_mode: "jwt".to_string(),
        client_id: "test-client".to_string(),
        client_secret: "test-secret".to_string(),
        jwt_assertion: "test-jwt".to_string(),
        authorization_code: String::new(),
        redirect_uri: String::new(),
        refresh_margin_secs: 60,
        request_timeout_secs: 2,
    }
}

fn test_config(verification_token: Option<String>) -> StonechatConfig {
    StonechatConfig {
        service: ServiceConfig {
            log_level: "info".to_string(),
        },
        database: DatabaseConfig {
            url: "postgresql://localhost/unused".to_string(),
            max_connections: 2,
        },
        ringcentral: rc_config(),
        chat: ChatConfig::default(),
        subscription: SubscriptionConfig {
            webhook_url: "https://chat.stonehaven.example/webhook".to_string(),
            event_filters: vec!["/restapi/v1.0/glip/posts".to_string()],
            expires_in_secs: 604_800,
            renew_interval_hours: 24,
            verification_token,
        },
        http: HttpConfig::default(),
    }
}

fn make_state(pool: PgPool, verification_token: Option<String>) -> Arc<HttpState> {
    let config = test_config(verification_token);
    let client = RcClient::new(&config.ringcentral).expect("client");
    let auth = Arc::new(AuthManager::new(
        pool.clone(),
        client.clone(),
        config.ringcentral.clone(),
    ));
    Arc::new(HttpState {
        relay: MessageRelay::new(
            pool.clone(),
            client.clone(),
            auth.clone(),
            config.chat.clone(),
        ),
        ingester: WebhookIngester::new(pool.clone(), config.chat.clone()),
        subscriptions: SubscriptionManager::new(
            pool.clone(),
            client,
            auth,
            config.subscription.clone(),
        ),
        pool,
        config,
    })
}

/// State whose pool never connects. Good enough for every path that fails
/// validation before reaching the store.
fn lazy_state(verification_token: Option<String>) -> Arc<HttpState> {
    let pool = PgPool::connect_lazy("postgresql://localhost/unused").expect("lazy pool");
    make_state(pool, verification_token)
}

async fn db_state() -> Option<Arc<HttpState>> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    run_migrations(&pool).await.ok()?;
    Some(make_state(pool, None))
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

// ===========================================================================
// TEST 1: GET /version via oneshot — no DB needed
// ===========================================================================
#[tokio::test]
async fn test_version_endpoint() {
    let app = build_router(lazy_state(None));

    let req = Request::builder()
        .method("GET")
        .uri("/version")
        .body(Body::empty())
        .expect("request");

    let resp = app.oneshot(req).await.expect("dispatch");
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert!(json["version"].is_string());
    assert_eq!(json["protocol"], "stonechat/1");
}

// ===========================================================================
// TEST 2: webhook validation handshake echoes the header on an empty 200
// ===========================================================================
#[tokio::test]
async fn test_webhook_validation_handshake() {
    let app = build_router(lazy_state(Some("secret".to_string())));

    let req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Validation-Token", "vt-12345")
        .body(Body::empty())
        .expect("request");

    let resp = app.oneshot(req).await.expect("dispatch");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("Validation-Token")
            .and_then(|v| v.to_str().ok()),
        Some("vt-12345"),
        "validation token must come back verbatim"
    );

    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    assert!(bytes.is_empty(), "handshake response body must be empty");
}

// ===========================================================================
// TEST 3: wrong or missing verification token is rejected
// ===========================================================================
#[tokio::test]
async fn test_webhook_verification_token_mismatch() {
    let app = build_router(lazy_state(Some("secret".to_string())));

    let req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Verification-Token", "wrong")
        .header("Content-Type", "application/json")
        .body(Body::from(r#"{"event":"/restapi/v1.0/glip/posts"}"#))
        .expect("request");

    let resp = app.oneshot(req).await.expect("dispatch");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let app = build_router(lazy_state(Some("secret".to_string())));
    let req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Content-Type", "application/json")
        .body(Body::from(r#"{"event":"/restapi/v1.0/glip/posts"}"#))
        .expect("request");

    let resp = app.oneshot(req).await.expect("dispatch");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "absent header too");
}

// ===========================================================================
// TEST 4: webhook body that is not JSON is a 400
// ===========================================================================
#[tokio::test]
async fn test_webhook_malformed_body() {
    let app = build_router(lazy_state(None));

    let req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .body(Body::from("definitely not json"))
        .expect("request");

    let resp = app.oneshot(req).await.expect("dispatch");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "error");
}

// ===========================================================================
// TEST 5: send_message validation — the 400 family
// ===========================================================================
#[tokio::test]
async fn test_send_message_validation_errors() {
    let state = lazy_state(None);
    let max_len = state.config.chat.max_message_len;

    let (status, body) = send_message_inner(
        &state.relay,
        max_len,
        SendMessageRequest {
            session_id: None,
            message: Some("hi".to_string()),
            visitor_name: None,
            visitor_email: None,
            visitor_phone: None,
        },
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, _) = send_message_inner(
        &state.relay,
        max_len,
        SendMessageRequest {
            session_id: Some("  ".to_string()),
            message: Some("hi".to_string()),
            visitor_name: None,
            visitor_email: None,
            visitor_phone: None,
        },
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "blank session_id");

    let (status, _) = send_message_inner(
        &state.relay,
        max_len,
        SendMessageRequest {
            session_id: Some("s-1".to_string()),
            message: None,
            visitor_name: None,
            visitor_email: None,
            visitor_phone: None,
        },
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "missing message");

    let (status, body) = send_message_inner(
        &state.relay,
        max_len,
        SendMessageRequest {
            session_id: Some("s-1".to_string()),
            message: Some("x".repeat(max_len + 1)),
            visitor_name: None,
            visitor_email: None,
            visitor_phone: None,
        },
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "oversized message");
    assert!(body["error"].as_str().unwrap_or("").contains("exceeds"));
}

// ===========================================================================
// TEST 6: get_messages without a session_id is a 400
// ===========================================================================
#[tokio::test]
async fn test_get_messages_missing_session_param() {
    let state = lazy_state(None);

    let (status, body) = get_messages_inner(
        &state.pool,
        state.config.chat.poll_limit,
        GetMessagesQuery {
            session_id: None,
            last_message_id: None,
        },
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

// ===========================================================================
// TEST 7: get_messages for an unknown session is a 404
// ===========================================================================
#[tokio::test]
async fn test_get_messages_unknown_session() {
    let Some(state) = db_state().await else {
        eprintln!("Skipping test_get_messages_unknown_session: DATABASE_URL not set");
        return;
    };

    let (status, body) = get_messages_inner(
        &state.pool,
        state.config.chat.poll_limit,
        GetMessagesQuery {
            session_id: Some(format!("missing-{}", Uuid::new_v4())),
            last_message_id: None,
        },
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
}

// ===========================================================================
// TEST 8: get_messages cursor semantics and idle revival
// ===========================================================================
#[tokio::test]
async fn test_get_messages_cursor_and_revival() {
    let Some(state) = db_state().await else {
        eprintln!("Skipping test_get_messages_cursor_and_revival: DATABASE_URL not set");
        return;
    };

    let session_key = format!("poll-{}", Uuid::new_v4());
    sessions::upsert_session(&state.pool, &session_key, &VisitorInfo::default())
        .await
        .expect("upsert");

    let first = messages::append(&state.pool, &session_key, SenderType::Visitor, "one", None)
        .await
        .expect("append");
    let second = messages::append(&state.pool, &session_key, SenderType::Agent, "two", None)
        .await
        .expect("append");

    // Demote to idle behind the API's back; polling must revive it.
    sqlx::query("UPDATE chat_sessions SET status = 'idle' WHERE session_key = $1")
        .bind(&session_key)
        .execute(&state.pool)
        .await
        .expect("demote");

    let (status, body) = get_messages_inner(
        &state.pool,
        state.config.chat.poll_limit,
        GetMessagesQuery {
            session_id: Some(session_key.clone()),
            last_message_id: Some(first),
        },
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_status"], "active");
    assert_eq!(body["count"], 1);
    assert_eq!(body["messages"][0]["id"], second);
    assert_eq!(body["messages"][0]["message"], "two");
    assert!(body["server_timestamp"].is_string());

    let session = sessions::get(&state.pool, &session_key)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(
        session.status,
        stonechat_core::models::SessionStatus::Active,
        "poll must revive an idle session"
    );
}

// ===========================================================================
// TEST 9: close_session — unknown 404, repeat close stays a success
// ===========================================================================
#[tokio::test]
async fn test_close_session_semantics() {
    let Some(state) = db_state().await else {
        eprintln!("Skipping test_close_session_semantics: DATABASE_URL not set");
        return;
    };

    let (status, _) = close_session_inner(
        &state.pool,
        CloseSessionRequest {
            session_id: Some(format!("missing-{}", Uuid::new_v4())),
        },
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let session_key = format!("close-{}", Uuid::new_v4());
    sessions::upsert_session(&state.pool, &session_key, &VisitorInfo::default())
        .await
        .expect("upsert");

    let (status, body) = close_session_inner(
        &state.pool,
        CloseSessionRequest {
            session_id: Some(session_key.clone()),
        },
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = close_session_inner(
        &state.pool,
        CloseSessionRequest {
            session_id: Some(session_key),
        },
    )
    .await;
    assert_eq!(status, StatusCode::OK, "second close is idempotent");
    assert_eq!(body["success"], true);
}

// ===========================================================================
// TEST 10: webhook ingestion through full router dispatch
// ===========================================================================
#[tokio::test]
async fn test_webhook_ingest_via_router() {
    let Some(state) = db_state().await else {
        eprintln!("Skipping test_webhook_ingest_via_router: DATABASE_URL not set");
        return;
    };

    let session_key = format!("hook-{}", Uuid::new_v4());
    let chat_id = format!("chat-{}", Uuid::new_v4());
    sessions::upsert_session(&state.pool, &session_key, &VisitorInfo::default())
        .await
        .expect("upsert");
    sessions::link_external_chat(&state.pool, &session_key, &chat_id)
        .await
        .expect("link");

    let payload = json!({
        "uuid": Uuid::new_v4().to_string(),
        "event": "/restapi/v1.0/glip/posts",
        "subscriptionId": "sub-test",
        "body": {
            "eventType": "PostAdded",
            "id": "post-router-1",
            "groupId": chat_id,
            "text": "hello from the agent",
            "creatorId": "agent-5"
        }
    });

    let app = build_router(state.clone());
    let req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Content-Type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request");
    let resp = app.oneshot(req).await.expect("dispatch");
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["result"], "stored");
    assert_eq!(json["session_id"], session_key);

    // Redelivery through the router: acknowledged, nothing stored.
    let app = build_router(state.clone());
    let req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Content-Type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request");
    let resp = app.oneshot(req).await.expect("dispatch");
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["result"], "duplicate");

    let rows = messages::list_since(&state.pool, &session_key, 0, 50)
        .await
        .expect("poll");
    assert_eq!(rows.len(), 1);
}

// ===========================================================================
// TEST 11: GET /health against a live database
// ===========================================================================
#[tokio::test]
async fn test_health_endpoint() {
    let Some(state) = db_state().await else {
        eprintln!("Skipping test_health_endpoint: DATABASE_URL not set");
        return;
    };

    let (status, body) = health_inner(&state.pool).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["postgresql"].is_string());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

// ===========================================================================
// TEST 12: unsubscribed webhook events are acknowledged, not stored
// ===========================================================================
#[tokio::test]
async fn test_webhook_unsubscribed_event_acknowledged() {
    let Some(state) = db_state().await else {
        eprintln!("Skipping test_webhook_unsubscribed_event_acknowledged: DATABASE_URL not set");
        return;
    };

    let payload = json!({
        "uuid": Uuid::new_v4().to_string(),
        "event": "/restapi/v1.0/presence",
        "subscriptionId": "sub-test",
        "body": { "id": "x" }
    });

    let app = build_router(state);
    let req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Content-Type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request");
    let resp = app.oneshot(req).await.expect("dispatch");
    assert_eq!(
        resp.status(),
        StatusCode::OK,
        "unknown events are acked so the backend stops redelivering"
    );
    let json = body_json(resp).await;
    assert_eq!(json["result"], "ignored");
}
