#![allow(clippy::unwrap_used, clippy::expect_used)]
//! REST support surface: init, reconnect reads, rating, agent/admin reads.

use std::{net::SocketAddr, sync::Arc};

use serde_json::{Value, json};

use {
    livedesk_config::LivedeskConfig,
    livedesk_gateway::{
        GatewayState, StoreAuthenticator,
        server::{build_app, build_state, spawn_background_tasks},
    },
    livedesk_store::AgentState,
};

struct TestServer {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

async fn start_server(mut config: LivedeskConfig) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("chat.db").display());
    config.database.url = url.clone();

    let pool = livedesk_store::connect(&url).await.unwrap();
    let state = build_state(config, pool).await.unwrap();
    let _shutdown = spawn_background_tasks(&state);

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn seed_agent(&self, name: &str, role: &str, token: &str) -> i64 {
        let email = format!("{}@example.test", name.to_lowercase());
        let digest = StoreAuthenticator::digest(token);
        let id = self
            .state
            .store
            .insert_user(name, &email, role, Some(&digest))
            .await
            .unwrap();
        self.state.store.upsert_presence(id, 5).await.unwrap();
        id
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = start_server(LivedeskConfig::default()).await;
    let body: Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn chat_init_returns_queue_position_without_agents() {
    let server = start_server(LivedeskConfig::default()).await;
    let body: Value = server
        .client
        .post(server.url("/api/chat/init"))
        .json(&json!({ "customerName": "Ada", "customerEmail": "ada@example.test" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert!(body["sessionId"].is_string());
    assert_eq!(body["customerToken"].as_str().unwrap().len(), 48);
    assert_eq!(body["queue"]["position"], 1);
    assert!(body["queue"]["estimatedWaitTime"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn chat_init_assigns_when_an_agent_is_free() {
    let server = start_server(LivedeskConfig::default()).await;
    let agent = server.seed_agent("Ana", "cs", "tok-ana").await;
    server
        .state
        .store
        .set_agent_state(agent, AgentState::Online)
        .await
        .unwrap();
    server.state.presence.rehydrate(&server.state.store).await.unwrap();

    let body: Value = server
        .client
        .post(server.url("/api/chat/init"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["assigned"]["cs"]["name"], "Ana");
    assert!(body.get("queue").is_none());
}

#[tokio::test]
async fn session_lookup_round_trips_and_404s() {
    let server = start_server(LivedeskConfig::default()).await;
    let init: Value = server
        .client
        .post(server.url("/api/chat/init"))
        .json(&json!({ "customerName": "Ada" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = init["customerToken"].as_str().unwrap();

    let body: Value = server
        .client
        .get(server.url(&format!("/api/chat/session/{token}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["session"]["customerName"], "Ada");
    // Only the system welcome entry so far.
    let messages = body["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["senderType"], "system");
    // The token itself is never echoed back inside the session object.
    assert!(body["data"]["session"].get("customerToken").is_none());

    let resp = server
        .client
        .get(server.url("/api/chat/session/not-a-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn rating_flow_enforces_resolved_state() {
    let server = start_server(LivedeskConfig::default()).await;
    let agent = server.seed_agent("Ana", "cs", "tok-ana").await;
    server
        .state
        .store
        .set_agent_state(agent, AgentState::Online)
        .await
        .unwrap();

    let init: Value = server
        .client
        .post(server.url("/api/chat/init"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = init["customerToken"].as_str().unwrap().to_string();
    let session_id = init["sessionId"].as_str().unwrap().to_string();

    // Not resolved yet.
    let resp = server
        .client
        .post(server.url("/api/chat/rating"))
        .json(&json!({ "customerToken": token, "rating": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "RATING_FAILED");

    // Resolve through the state machine, then rate.
    server
        .state
        .store
        .assign_session(&session_id, agent)
        .await
        .ok();
    server
        .state
        .store
        .resolve_session(&session_id, agent)
        .await
        .unwrap();

    let resp = server
        .client
        .post(server.url("/api/chat/rating"))
        .json(&json!({ "customerToken": token, "rating": 6 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_RATING");

    let body: Value = server
        .client
        .post(server.url("/api/chat/rating"))
        .json(&json!({ "customerToken": token, "rating": 5, "feedback": "great" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["rating"], 5);
}

#[tokio::test]
async fn agent_endpoints_require_bearer_tokens() {
    let server = start_server(LivedeskConfig::default()).await;
    server.seed_agent("Ana", "cs", "tok-ana").await;

    let resp = server
        .client
        .get(server.url("/api/agent/queue"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);

    let body: Value = server
        .client
        .get(server.url("/api/agent/queue"))
        .header("Authorization", "Bearer tok-ana")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn agent_reads_cover_chats_history_and_canned() {
    let config = LivedeskConfig {
        chat: livedesk_config::ChatConfig {
            auto_assign_enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let server = start_server(config).await;
    let agent = server.seed_agent("Ana", "cs", "tok-ana").await;
    server
        .state
        .store
        .set_agent_state(agent, AgentState::Online)
        .await
        .unwrap();
    server
        .state
        .store
        .insert_canned_response("Greeting", "Hi! How can I help?", Some(agent))
        .await
        .unwrap();

    let init: Value = server
        .client
        .post(server.url("/api/chat/init"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = init["sessionId"].as_str().unwrap().to_string();
    server
        .state
        .store
        .assign_session(&session_id, agent)
        .await
        .unwrap();

    let chats: Value = server
        .client
        .get(server.url("/api/agent/chats"))
        .header("Authorization", "Bearer tok-ana")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chats["data"].as_array().unwrap().len(), 1);

    server
        .state
        .store
        .resolve_session(&session_id, agent)
        .await
        .unwrap();
    let history: Value = server
        .client
        .get(server.url("/api/agent/history"))
        .header("Authorization", "Bearer tok-ana")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["data"].as_array().unwrap().len(), 1);

    let canned: Value = server
        .client
        .get(server.url("/api/agent/canned"))
        .header("Authorization", "Bearer tok-ana")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(canned["data"][0]["title"], "Greeting");
}

#[tokio::test]
async fn activity_log_is_admin_only() {
    let server = start_server(LivedeskConfig::default()).await;
    server.seed_agent("Ana", "cs", "tok-ana").await;
    server.seed_agent("Root", "admin", "tok-root").await;

    let resp = server
        .client
        .get(server.url("/api/admin/activity"))
        .header("Authorization", "Bearer tok-ana")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let body: Value = server
        .client
        .get(server.url("/api/admin/activity"))
        .header("Authorization", "Bearer tok-root")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert!(body["data"].is_array());
}
