use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// ── Enums ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Resolved,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "resolved" => Ok(Self::Resolved),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(StoreError::Decode(format!("session status '{other}'"))),
        }
    }

    /// Resolved and abandoned sessions accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Customer,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "customer" => Ok(Self::Customer),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(StoreError::Decode(format!("sender type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "system" => Ok(Self::System),
            other => Err(StoreError::Decode(format!("message kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Online,
    Busy,
    Offline,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "online" => Ok(Self::Online),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(StoreError::Decode(format!("agent state '{other}'"))),
        }
    }
}

// ── Rows ─────────────────────────────────────────────────────────────────────

/// One customer conversation, from `start_chat` to terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub source_url: Option<String>,
    /// Opaque resume credential; never published on broker topics.
    #[serde(skip_serializing)]
    pub customer_token: String,
    pub status: SessionStatus,
    pub assigned_agent_id: Option<i64>,
    pub created_at: i64,
    pub assigned_at: Option<i64>,
    pub resolved_at: Option<i64>,
    pub rating: Option<i64>,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: String,
    pub sender_type: SenderType,
    pub sender_id: Option<i64>,
    pub content: String,
    pub kind: MessageKind,
    pub file_ref: Option<String>,
    pub created_at: i64,
}

/// Presence row joined with the agent's display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresence {
    pub user_id: i64,
    pub name: String,
    pub state: AgentState,
    pub current_chats: i64,
    pub max_chats: i64,
    pub last_active_at: i64,
}

impl AgentPresence {
    /// Eligible for new assignments: online with spare capacity.
    pub fn is_available(&self) -> bool {
        self.state == AgentState::Online && self.current_chats < self.max_chats
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CannedResponse {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub created_by: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: i64,
}

// ── Inputs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub sender_type: SenderType,
    pub sender_id: Option<i64>,
    pub content: String,
    pub kind: MessageKind,
    pub file_ref: Option<String>,
}

impl NewMessage {
    pub fn text(session_id: impl Into<String>, sender_type: SenderType, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sender_type,
            sender_id: None,
            content: content.into(),
            kind: MessageKind::Text,
            file_ref: None,
        }
    }
}
