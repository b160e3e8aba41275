//! REST support surface: reconnect, history and agent/admin reads.
//!
//! Non-2xx responses all carry `{ "success": false, "message", "code"? }`.

use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
    },
    livedesk_chat::ChatError,
    livedesk_protocol::error_codes,
    livedesk_store::CreateSession,
    serde::Deserialize,
    serde_json::json,
    tracing::warn,
};

use crate::{auth::{AgentIdentity, AgentRole}, state::GatewayState};

/// Rough per-position wait estimate surfaced by `/api/chat/init`.
const WAIT_SECONDS_PER_POSITION: i64 = 120;

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            error_codes::UNAUTHORIZED,
            "missing or invalid bearer token",
        )
    }

    fn forbidden() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            error_codes::UNAUTHORIZED,
            "admin role required",
        )
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::SessionNotFound => StatusCode::NOT_FOUND,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::InvalidSession
            | ChatError::EmptyMessage
            | ChatError::InvalidRating
            | ChatError::AlreadyAssigned
            | ChatError::AtCapacity
            | ChatError::NotOnline
            | ChatError::NotAssigned
            | ChatError::TargetNotOnline
            | ChatError::TargetAtCapacity => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<livedesk_store::StoreError> for ApiError {
    fn from(err: livedesk_store::StoreError) -> Self {
        warn!(error = %err, "store failure in REST handler");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::SERVER_ERROR,
            "internal error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "message": self.message,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

/// Resolve the bearer credential on agent/admin endpoints.
async fn require_agent(
    state: &Arc<GatewayState>,
    headers: &HeaderMap,
) -> Result<AgentIdentity, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;
    state
        .authenticator
        .authenticate(token)
        .await
        .ok_or_else(ApiError::unauthorized)
}

pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into());
    Json(json!({
        "status": "ok",
        "host": host,
        "version": env!("CARGO_PKG_VERSION"),
        "autoAssign": state.config.chat.auto_assign_enabled,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatInitBody {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub source_url: Option<String>,
}

/// `POST /api/chat/init`: widget bootstrap before the socket opens. Runs one
/// dispatch pass inline so the response can already carry an assignment.
pub async fn chat_init(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<ChatInitBody>,
) -> ApiResult {
    let session = state
        .store
        .create_session(CreateSession {
            customer_name: body.customer_name,
            customer_email: body.customer_email,
            source_url: body.source_url,
        })
        .await
        .map_err(|e| ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INIT_FAILED,
            e.to_string(),
        ))?;

    let position = state.store.queue_position(&session.id).await?.unwrap_or(1);
    livedesk_dispatch::events::announce_new_chat(&state.broker, &session, position);

    if let Err(e) = state.dispatcher.drain().await {
        warn!(error = %e, "inline dispatch after init failed");
    }

    let current = state
        .store
        .session_by_id(&session.id)
        .await?
        .unwrap_or(session);

    let mut body = json!({
        "success": true,
        "sessionId": current.id,
        "customerToken": current.customer_token,
    });
    match current.assigned_agent_id {
        Some(agent_id) => {
            let cs = state.store.user_by_id(agent_id).await?;
            body["assigned"] = json!({
                "cs": cs.map(|u| json!({ "id": u.id, "name": u.name })),
            });
        },
        None => {
            let position = state.store.queue_position(&current.id).await?.unwrap_or(1);
            body["queue"] = json!({
                "position": position,
                "estimatedWaitTime": position * WAIT_SECONDS_PER_POSITION,
            });
        },
    }
    Ok(Json(body))
}

/// `GET /api/chat/session/{customer_token}`: full session for reconnect.
pub async fn chat_session(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
) -> ApiResult {
    let session = state
        .store
        .session_by_token(&token)
        .await?
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                error_codes::SESSION_NOT_FOUND,
                "unknown customer token",
            )
        })?;
    let messages = state.store.messages_for_session(&session.id).await?;
    let assigned_cs = match session.assigned_agent_id {
        Some(agent_id) => state
            .store
            .user_by_id(agent_id)
            .await?
            .map(|u| json!({ "id": u.id, "name": u.name })),
        None => None,
    };

    Ok(Json(json!({
        "success": true,
        "data": {
            "session": session,
            "messages": messages,
            "assignedCs": assigned_cs,
        },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingBody {
    pub customer_token: String,
    pub rating: i64,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// `POST /api/chat/rating`.
pub async fn chat_rating(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<RatingBody>,
) -> ApiResult {
    let session = state
        .chat
        .rate_by_token(&body.customer_token, body.rating, body.feedback.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "data": { "sessionId": session.id, "rating": session.rating },
    })))
}

/// `GET /api/agent/chats`: the caller's active sessions.
pub async fn agent_chats(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> ApiResult {
    let identity = require_agent(&state, &headers).await?;
    let sessions = state
        .store
        .active_sessions_for_agent(identity.user_id)
        .await?;
    Ok(Json(json!({ "success": true, "data": sessions })))
}

/// `GET /api/agent/queue`: waiting sessions, FIFO.
pub async fn agent_queue(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> ApiResult {
    require_agent(&state, &headers).await?;
    let sessions = state.store.waiting_sessions().await?;
    Ok(Json(json!({ "success": true, "data": sessions })))
}

/// `GET /api/agent/history`: recently closed sessions.
pub async fn agent_history(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> ApiResult {
    require_agent(&state, &headers).await?;
    let sessions = state.store.recent_closed_sessions(50).await?;
    Ok(Json(json!({ "success": true, "data": sessions })))
}

/// `GET /api/agent/canned`: quick replies for the composer.
pub async fn agent_canned(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> ApiResult {
    require_agent(&state, &headers).await?;
    let canned = state.store.canned_responses().await?;
    Ok(Json(json!({ "success": true, "data": canned })))
}

/// `GET /api/admin/activity`: audit trail, admin only.
pub async fn admin_activity(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> ApiResult {
    let identity = require_agent(&state, &headers).await?;
    if identity.role != AgentRole::Admin {
        return Err(ApiError::forbidden());
    }
    let entries = state.store.recent_activity(100).await?;
    Ok(Json(json!({ "success": true, "data": entries })))
}
