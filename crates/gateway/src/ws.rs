//! WebSocket connection lifecycle: upgrade → authenticate → register →
//! serialized read loop → cleanup.
//!
//! One frame is handled at a time per connection, so a client cannot race
//! itself. Fan-out to the socket runs in a separate write task draining the
//! broker queue; the close code it sends on exit is picked by the read side.

use std::sync::{
    Arc,
    atomic::{AtomicU16, Ordering},
};

use {
    axum::{
        extract::{
            Query, State, WebSocketUpgrade,
            ws::{CloseFrame, Message, WebSocket},
        },
        response::Response,
    },
    futures::{SinkExt, stream::StreamExt},
    livedesk_broker::{OutboundQueue, Topic},
    livedesk_protocol::{Envelope, close_codes, error_codes, MAX_FRAME_BYTES},
    serde::Deserialize,
    tracing::{debug, info, warn},
};

use crate::{
    auth::AgentRole,
    handlers::{self, Principal},
    state::GatewayState,
};

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

pub async fn customer_upgrade(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_customer(socket, state, query.token))
}

pub async fn cs_upgrade(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent(socket, state, query.token, false))
}

pub async fn admin_upgrade(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent(socket, state, query.token, true))
}

/// Close the raw socket before any registration happened.
async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Spawn the write task: drains the broker queue into the socket, then sends
/// the close frame chosen by the read side.
fn spawn_writer(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    queue: Arc<OutboundQueue>,
    close_code: Arc<AtomicU16>,
    conn_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = queue.pop().await {
            if ws_tx.send(Message::Text(frame.json.into())).await.is_err() {
                debug!(conn_id = %conn_id, "ws: write loop closed");
                return;
            }
        }
        let code = match close_code.load(Ordering::Acquire) {
            0 => close_codes::NORMAL,
            c => c,
        };
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "".into(),
            })))
            .await;
    })
}

/// Let the write task drain and send its close frame. A wedged writer is
/// detached; it ends on its own when the socket drops.
async fn finish_writer(writer: tokio::task::JoinHandle<()>) {
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer).await;
}

async fn handle_customer(socket: WebSocket, state: Arc<GatewayState>, token: Option<String>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "ws: customer connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let queue = state.broker.register_connection(&conn_id);
    let close_code = Arc::new(AtomicU16::new(0));
    let writer = spawn_writer(ws_tx, queue, Arc::clone(&close_code), conn_id.clone());

    // A presented resume token re-binds the connection to its session and
    // replays the transcript. An unknown token leaves the connection latent;
    // the client starts a fresh chat.
    let mut bound: Option<String> = None;
    if let Some(token) = token {
        match state.chat.restore_session(&conn_id, &token).await {
            Ok(session) => bound = Some(session.id),
            Err(e) => {
                debug!(conn_id = %conn_id, code = e.code(), "ws: token restore failed");
                state
                    .broker
                    .send_to(&conn_id, &Envelope::error(e.code(), e.to_string(), None));
            },
        }
    }

    // Customers are anonymous and flaky: a connection with no inbound frames
    // for the idle window is closed 4408. The session itself survives.
    let idle_limit = Some(std::time::Duration::from_secs(
        state.config.chat.chat_idle_timeout_seconds.max(60),
    ));
    let principal = Principal::Customer;
    read_loop(&state, &conn_id, &principal, &mut bound, &mut ws_rx, &close_code, idle_limit).await;

    // Customer disconnect does not abandon the chat; the session stays put
    // for the reaper or an explicit end.
    state.broker.unregister_connection(&conn_id);
    finish_writer(writer).await;
    info!(conn_id = %conn_id, "ws: customer disconnected");
}

async fn handle_agent(
    socket: WebSocket,
    state: Arc<GatewayState>,
    token: Option<String>,
    admin_path: bool,
) {
    let authenticated = match token {
        Some(ref t) => state.authenticator.authenticate(t).await,
        None => None,
    };
    let Some(identity) = authenticated else {
        warn!("ws: agent upgrade without valid credential");
        reject(socket, close_codes::UNAUTHENTICATED, "unauthenticated").await;
        return;
    };
    if admin_path && identity.role != AgentRole::Admin {
        warn!(user_id = identity.user_id, "ws: admin path denied");
        reject(socket, close_codes::FORBIDDEN, "forbidden").await;
        return;
    }

    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(
        conn_id = %conn_id,
        user_id = identity.user_id,
        admin = admin_path,
        "ws: agent connected"
    );

    let (ws_tx, mut ws_rx) = socket.split();
    let queue = state.broker.register_connection(&conn_id);
    let close_code = Arc::new(AtomicU16::new(0));
    let writer = spawn_writer(ws_tx, queue, Arc::clone(&close_code), conn_id.clone());

    let principal = if admin_path {
        state.broker.subscribe(&conn_id, &Topic::admin_stats());
        state.broker.subscribe(&conn_id, &Topic::queue());
        Principal::Admin(identity.clone())
    } else {
        state.broker.subscribe(&conn_id, &Topic::agent(identity.user_id));
        state.broker.subscribe(&conn_id, &Topic::queue());
        match state.chat.agent_connect(identity.user_id).await {
            Ok(connection) => {
                for session in &connection.active_sessions {
                    state.broker.subscribe(&conn_id, &Topic::session(&session.id));
                }
            },
            Err(e) => {
                warn!(user_id = identity.user_id, code = e.code(), "ws: agent connect failed");
                state
                    .broker
                    .send_to(&conn_id, &Envelope::error(e.code(), e.to_string(), None));
            },
        }
        state.agent_connected(identity.user_id).await;
        Principal::Cs(identity.clone())
    };

    // Agents are authenticated staff; a quiet dashboard is not idle.
    let mut bound: Option<String> = None;
    read_loop(&state, &conn_id, &principal, &mut bound, &mut ws_rx, &close_code, None).await;

    state.broker.unregister_connection(&conn_id);
    finish_writer(writer).await;

    // An agent going away is a presence fact; their chats stay assigned.
    if !admin_path && state.agent_disconnected(identity.user_id).await {
        state.chat.agent_disconnect(identity.user_id).await;
    }
    info!(conn_id = %conn_id, user_id = identity.user_id, "ws: agent disconnected");
}

/// Serialized inbound loop: one frame at a time, each under the handler
/// deadline. Malformed and oversized frames are dropped silently.
#[allow(clippy::too_many_arguments)]
async fn read_loop(
    state: &Arc<GatewayState>,
    conn_id: &str,
    principal: &Principal,
    bound: &mut Option<String>,
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    close_code: &AtomicU16,
    idle_limit: Option<std::time::Duration>,
) {
    let deadline = state.config.chat.db_op_timeout();

    loop {
        let next = match idle_limit {
            Some(limit) => match tokio::time::timeout(limit, ws_rx.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!(conn_id, "ws: idle connection closed");
                    close_code.store(close_codes::IDLE_TIMEOUT, Ordering::Release);
                    return;
                },
            },
            None => ws_rx.next().await,
        };
        let Some(msg) = next else { return };

        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => return,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id, error = %e, "ws: read error");
                return;
            },
        };

        if text.len() > MAX_FRAME_BYTES {
            warn!(conn_id, size = text.len(), "ws: oversized frame dropped");
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(e) => {
                debug!(conn_id, error = %e, "ws: malformed frame dropped");
                continue;
            },
        };

        let request_id = envelope.request_id.clone();
        let event = envelope.event.clone();
        match tokio::time::timeout(
            deadline,
            handlers::handle_event(state, conn_id, principal, bound, envelope),
        )
        .await
        {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                debug!(conn_id, event = %event, code = e.code(), "ws: handler rejected frame");
                state
                    .broker
                    .send_to(conn_id, &Envelope::error(e.code(), e.to_string(), request_id));
            },
            Err(_) => {
                warn!(conn_id, event = %event, "ws: handler deadline exceeded");
                state.broker.send_to(
                    conn_id,
                    &Envelope::error(
                        error_codes::SERVER_ERROR,
                        "operation timed out",
                        request_id,
                    ),
                );
            },
        }
    }
}
