//! Chat WebSocket wire protocol definitions.
//!
//! All traffic uses one JSON envelope shape in both directions:
//!
//! ```json
//! { "event": "<string>", "data": {}, "timestamp": 1712345678901, "requestId": "opt" }
//! ```
//!
//! Event names and error codes are part of the external contract consumed by
//! the widget and the agent dashboard; treat them as frozen identifiers.

use serde::{Deserialize, Serialize};

pub mod payloads;

// ── Constants ────────────────────────────────────────────────────────────────

/// Hard cap on a single inbound frame. Oversized frames are dropped.
pub const MAX_FRAME_BYTES: usize = 65_536; // 64 KiB
/// Maximum message body length after trimming.
pub const MAX_MESSAGE_CHARS: usize = 2_000;
/// Per-connection outbound buffer, in frames. Lossy events are dropped when
/// a consumer falls this far behind; messages are never dropped.
pub const OUTBOUND_BUFFER_FRAMES: usize = 256;

// ── Close codes ──────────────────────────────────────────────────────────────

pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const UNAUTHENTICATED: u16 = 4401;
    pub const FORBIDDEN: u16 = 4403;
    pub const IDLE_TIMEOUT: u16 = 4408;
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const INVALID_SESSION: &str = "INVALID_SESSION";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const EMPTY_MESSAGE: &str = "EMPTY_MESSAGE";
    pub const ALREADY_ASSIGNED: &str = "ALREADY_ASSIGNED";
    pub const AT_CAPACITY: &str = "AT_CAPACITY";
    pub const NOT_ONLINE: &str = "NOT_ONLINE";
    pub const NOT_ASSIGNED: &str = "NOT_ASSIGNED";
    pub const TARGET_NOT_ONLINE: &str = "TARGET_NOT_ONLINE";
    pub const TARGET_AT_CAPACITY: &str = "TARGET_AT_CAPACITY";
    pub const INVALID_RATING: &str = "INVALID_RATING";
    pub const INIT_FAILED: &str = "INIT_FAILED";
    pub const SEND_FAILED: &str = "SEND_FAILED";
    pub const RESOLVE_FAILED: &str = "RESOLVE_FAILED";
    pub const TRANSFER_FAILED: &str = "TRANSFER_FAILED";
    pub const RATING_FAILED: &str = "RATING_FAILED";
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
}

// ── Event names ──────────────────────────────────────────────────────────────

/// Client → server events.
pub mod client_events {
    pub const CUSTOMER_START_CHAT: &str = "customer:start_chat";
    pub const CUSTOMER_SEND_MESSAGE: &str = "customer:send_message";
    pub const CUSTOMER_TYPING: &str = "customer:typing";
    pub const CUSTOMER_END_CHAT: &str = "customer:end_chat";
    pub const CUSTOMER_RATING: &str = "customer:rating";

    pub const CS_SET_STATUS: &str = "cs:set_status";
    pub const CS_ACCEPT_CHAT: &str = "cs:accept_chat";
    pub const CS_SEND_MESSAGE: &str = "cs:send_message";
    pub const CS_TYPING: &str = "cs:typing";
    pub const CS_RESOLVE_CHAT: &str = "cs:resolve_chat";
    pub const CS_TRANSFER_CHAT: &str = "cs:transfer_chat";

    pub const ADMIN_SUBSCRIBE_STATS: &str = "admin:subscribe_stats";
    pub const ADMIN_FORCE_ASSIGN: &str = "admin:force_assign";
}

/// Server → client events.
pub mod server_events {
    pub const CHAT_STARTED: &str = "chat:started";
    pub const CHAT_ASSIGNED: &str = "chat:assigned";
    pub const CHAT_NEW_ASSIGNED: &str = "chat:new_assigned";
    pub const CHAT_MESSAGE: &str = "chat:message";
    pub const CHAT_CUSTOMER_TYPING: &str = "chat:customer_typing";
    pub const CHAT_CS_TYPING: &str = "chat:cs_typing";
    pub const CHAT_QUEUE_POSITION: &str = "chat:queue_position";
    pub const CHAT_TRANSFERRED: &str = "chat:transferred";
    pub const CHAT_TRANSFERRED_IN: &str = "chat:transferred_in";
    pub const CHAT_TRANSFERRED_OUT: &str = "chat:transferred_out";
    pub const CHAT_RESOLVED: &str = "chat:resolved";
    pub const CHAT_ENDED: &str = "chat:ended";
    pub const CHAT_CUSTOMER_LEFT: &str = "chat:customer_left";
    pub const QUEUE_UPDATE: &str = "queue:update";
    pub const QUEUE_NEW_CHAT: &str = "queue:new_chat";
    pub const CS_STATUS_CHANGED: &str = "cs:status_changed";
    pub const STATS_UPDATE: &str = "stats:update";
    pub const SYSTEM_ERROR: &str = "system:error";
    pub const SESSION_RESTORED: &str = "session:restored";
}

/// Returns true for events a slow consumer may lose without harm. Everything
/// else must reach the subscriber's buffer.
pub fn is_lossy_event(event: &str) -> bool {
    matches!(
        event,
        server_events::CHAT_CUSTOMER_TYPING
            | server_events::CHAT_CS_TYPING
            | server_events::CS_STATUS_CHANGED
            | server_events::STATS_UPDATE
            | server_events::QUEUE_UPDATE
    )
}

// ── Roles ────────────────────────────────────────────────────────────────────

pub mod roles {
    pub const CUSTOMER: &str = "customer";
    pub const CS: &str = "cs";
    pub const ADMIN: &str = "admin";
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The single frame shape used in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: livedesk_common::now_ms(),
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Build a `system:error` frame.
    pub fn error(code: &str, message: impl Into<String>, request_id: Option<String>) -> Self {
        let mut data = serde_json::json!({
            "code": code,
            "message": message.into(),
        });
        if let (Some(obj), Some(id)) = (data.as_object_mut(), request_id.as_ref()) {
            obj.insert("requestId".into(), serde_json::Value::String(id.clone()));
        }
        Self::new(server_events::SYSTEM_ERROR, data).with_request_id(request_id)
    }
}
