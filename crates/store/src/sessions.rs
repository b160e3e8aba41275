//! Session and message operations.
//!
//! The claim/resolve/transfer/abandon transitions are written so their first
//! statement is the guarded UPDATE. That acquires the SQLite write lock up
//! front: two racing claims serialise on the database and the loser observes
//! the already-changed row instead of deadlocking on a lock upgrade.

use livedesk_common::{now_ms, to_hex};
use rand::RngCore;

use crate::{
    ChatStore, Result,
    error::StoreError,
    types::{
        ChatMessage, ChatSession, CreateSession, MessageKind, NewMessage, SenderType,
        SessionStatus,
    },
};

pub const WELCOME_MESSAGE: &str = "Welcome! An agent will be with you shortly.";
pub const IDLE_CLOSE_MESSAGE: &str = "Chat closed due to inactivity";
pub const CUSTOMER_LEFT_MESSAGE: &str = "Customer ended the chat";
pub const RESOLVED_MESSAGE: &str = "Chat resolved";
pub const REQUEUED_MESSAGE: &str = "Chat returned to the queue";

const SESSION_COLS: &str = "id, customer_name, customer_email, source_url, customer_token, \
     status, assigned_agent_id, created_at, assigned_at, resolved_at, rating, feedback";

type SessionRow = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<i64>,
    i64,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
);

fn session_from_row(row: SessionRow) -> Result<ChatSession> {
    Ok(ChatSession {
        id: row.0,
        customer_name: row.1,
        customer_email: row.2,
        source_url: row.3,
        customer_token: row.4,
        status: SessionStatus::parse(&row.5)?,
        assigned_agent_id: row.6,
        created_at: row.7,
        assigned_at: row.8,
        resolved_at: row.9,
        rating: row.10,
        feedback: row.11,
    })
}

type MessageRow = (
    i64,
    String,
    String,
    Option<i64>,
    String,
    String,
    Option<String>,
    i64,
);

fn message_from_row(row: MessageRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.0,
        session_id: row.1,
        sender_type: SenderType::parse(&row.2)?,
        sender_id: row.3,
        content: row.4,
        kind: MessageKind::parse(&row.5)?,
        file_ref: row.6,
        created_at: row.7,
    })
}

/// 24 random bytes, hex-encoded. Enough entropy that tokens cannot be
/// enumerated or guessed.
fn generate_customer_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    to_hex(&bytes)
}

async fn insert_message_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    msg: &NewMessage,
    now: i64,
) -> Result<ChatMessage> {
    let res = sqlx::query(
        "INSERT INTO chat_messages
         (session_id, sender_type, sender_id, content, kind, file_ref, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&msg.session_id)
    .bind(msg.sender_type.as_str())
    .bind(msg.sender_id)
    .bind(&msg.content)
    .bind(msg.kind.as_str())
    .bind(&msg.file_ref)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(ChatMessage {
        id: res.last_insert_rowid(),
        session_id: msg.session_id.clone(),
        sender_type: msg.sender_type,
        sender_id: msg.sender_id,
        content: msg.content.clone(),
        kind: msg.kind,
        file_ref: msg.file_ref.clone(),
        created_at: now,
    })
}

fn system_message(session_id: &str, content: &str) -> NewMessage {
    NewMessage {
        session_id: session_id.to_string(),
        sender_type: SenderType::System,
        sender_id: None,
        content: content.to_string(),
        kind: MessageKind::System,
        file_ref: None,
    }
}

impl ChatStore {
    /// Create a new waiting session and its `system` welcome message.
    pub async fn create_session(&self, input: CreateSession) -> Result<ChatSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = generate_customer_token();
        let now = now_ms();

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO chat_sessions
             (id, customer_name, customer_email, source_url, customer_token, status, created_at)
             VALUES (?, ?, ?, ?, ?, 'waiting', ?)",
        )
        .bind(&id)
        .bind(&input.customer_name)
        .bind(&input.customer_email)
        .bind(&input.source_url)
        .bind(&token)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        insert_message_tx(&mut tx, &system_message(&id, WELCOME_MESSAGE), now).await?;
        tx.commit().await?;

        Ok(ChatSession {
            id,
            customer_name: input.customer_name,
            customer_email: input.customer_email,
            source_url: input.source_url,
            customer_token: token,
            status: SessionStatus::Waiting,
            assigned_agent_id: None,
            created_at: now,
            assigned_at: None,
            resolved_at: None,
            rating: None,
            feedback: None,
        })
    }

    pub async fn session_by_id(&self, id: &str) -> Result<Option<ChatSession>> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {SESSION_COLS} FROM chat_sessions WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        row.map(session_from_row).transpose()
    }

    pub async fn session_by_token(&self, token: &str) -> Result<Option<ChatSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLS} FROM chat_sessions WHERE customer_token = ?"
        ))
        .bind(token)
        .fetch_optional(self.pool())
        .await?;
        row.map(session_from_row).transpose()
    }

    fn require_session(found: Option<ChatSession>) -> Result<ChatSession> {
        found.ok_or(StoreError::SessionNotFound)
    }

    /// Append a customer/agent message. The insert is guarded by the session
    /// status in the same statement, so nothing can land after `resolved_at`.
    pub async fn append_message(&self, msg: NewMessage) -> Result<ChatMessage> {
        let now = now_ms();
        let res = sqlx::query(
            "INSERT INTO chat_messages
             (session_id, sender_type, sender_id, content, kind, file_ref, created_at)
             SELECT ?, ?, ?, ?, ?, ?, ?
             WHERE EXISTS (
                 SELECT 1 FROM chat_sessions
                 WHERE id = ? AND status IN ('waiting', 'active')
             )",
        )
        .bind(&msg.session_id)
        .bind(msg.sender_type.as_str())
        .bind(msg.sender_id)
        .bind(&msg.content)
        .bind(msg.kind.as_str())
        .bind(&msg.file_ref)
        .bind(now)
        .bind(&msg.session_id)
        .execute(self.pool())
        .await?;

        if res.rows_affected() == 0 {
            let session = Self::require_session(self.session_by_id(&msg.session_id).await?)?;
            debug_assert!(session.status.is_terminal());
            return Err(StoreError::TerminalSession);
        }

        Ok(ChatMessage {
            id: res.last_insert_rowid(),
            session_id: msg.session_id,
            sender_type: msg.sender_type,
            sender_id: msg.sender_id,
            content: msg.content,
            kind: msg.kind,
            file_ref: msg.file_ref,
            created_at: now,
        })
    }

    /// Ordered transcript: append order is `(created_at, id)`.
    pub async fn messages_for_session(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, sender_type, sender_id, content, kind, file_ref, created_at
             FROM chat_messages
             WHERE session_id = ?
             ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    /// Claim a waiting session for an agent: status flip, capacity increment
    /// and the join message commit together or not at all. A racing claim on
    /// the same session fails with `AlreadyAssigned`; a full or offline agent
    /// leaves the session untouched.
    pub async fn assign_session(
        &self,
        session_id: &str,
        agent_id: i64,
    ) -> Result<(ChatSession, ChatMessage)> {
        let now = now_ms();
        let mut tx = self.pool().begin().await?;

        let claimed = sqlx::query(
            "UPDATE chat_sessions
             SET status = 'active', assigned_agent_id = ?, assigned_at = ?
             WHERE id = ? AND status = 'waiting'",
        )
        .bind(agent_id)
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            Self::require_session(self.session_by_id(session_id).await?)?;
            return Err(StoreError::AlreadyAssigned);
        }

        let reserved = sqlx::query(
            "UPDATE agent_presence
             SET current_chats = current_chats + 1, last_active_at = ?
             WHERE user_id = ? AND state != 'offline' AND current_chats < max_chats",
        )
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if reserved == 0 {
            tx.rollback().await?;
            return Err(self.classify_capacity_failure(agent_id, false).await?);
        }

        let agent_name: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(agent_name) = agent_name else {
            tx.rollback().await?;
            return Err(StoreError::AgentNotFound);
        };

        let joined = format!("Agent {agent_name} joined the chat");
        let message = insert_message_tx(&mut tx, &system_message(session_id, &joined), now).await?;
        tx.commit().await?;

        let session = Self::require_session(self.session_by_id(session_id).await?)?;
        Ok((session, message))
    }

    /// Resolve an active session owned by `agent_id` and release one unit of
    /// its capacity.
    pub async fn resolve_session(
        &self,
        session_id: &str,
        agent_id: i64,
    ) -> Result<(ChatSession, ChatMessage)> {
        let now = now_ms();
        let mut tx = self.pool().begin().await?;

        let resolved = sqlx::query(
            "UPDATE chat_sessions
             SET status = 'resolved', resolved_at = ?
             WHERE id = ? AND status = 'active' AND assigned_agent_id = ?",
        )
        .bind(now)
        .bind(session_id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if resolved == 0 {
            tx.rollback().await?;
            Self::require_session(self.session_by_id(session_id).await?)?;
            return Err(StoreError::NotAssigned);
        }

        sqlx::query(
            "UPDATE agent_presence
             SET current_chats = MAX(current_chats - 1, 0), last_active_at = ?
             WHERE user_id = ?",
        )
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        let message =
            insert_message_tx(&mut tx, &system_message(session_id, RESOLVED_MESSAGE), now).await?;
        tx.commit().await?;

        let session = Self::require_session(self.session_by_id(session_id).await?)?;
        Ok((session, message))
    }

    /// Abandon a waiting or active session. Returns the released agent id if
    /// the session was active (its capacity is decremented in the same
    /// transaction).
    pub async fn abandon_session(
        &self,
        session_id: &str,
        note: &str,
    ) -> Result<(ChatSession, ChatMessage, Option<i64>)> {
        let now = now_ms();
        let mut tx = self.pool().begin().await?;

        // Waiting sessions have no assignee, so a non-null id here means the
        // session was active and holds one unit of agent capacity.
        let released: Option<(Option<i64>,)> = sqlx::query_as(
            "UPDATE chat_sessions
             SET status = 'abandoned', resolved_at = ?
             WHERE id = ? AND status IN ('waiting', 'active')
             RETURNING assigned_agent_id",
        )
        .bind(now)
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((released_agent,)) = released else {
            tx.rollback().await?;
            Self::require_session(self.session_by_id(session_id).await?)?;
            return Err(StoreError::TerminalSession);
        };

        if let Some(agent_id) = released_agent {
            sqlx::query(
                "UPDATE agent_presence
                 SET current_chats = MAX(current_chats - 1, 0)
                 WHERE user_id = ?",
            )
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        }

        let message = insert_message_tx(&mut tx, &system_message(session_id, note), now).await?;
        tx.commit().await?;

        let session = Self::require_session(self.session_by_id(session_id).await?)?;
        Ok((session, message, released_agent))
    }

    /// Move an active session from one agent to another. Target reservation
    /// and source release are a single transaction; on any failure the source
    /// keeps the chat.
    pub async fn transfer_session(
        &self,
        session_id: &str,
        from_agent: i64,
        to_agent: i64,
    ) -> Result<(ChatSession, ChatMessage)> {
        let now = now_ms();
        let mut tx = self.pool().begin().await?;

        let moved = sqlx::query(
            "UPDATE chat_sessions
             SET assigned_agent_id = ?, assigned_at = ?
             WHERE id = ? AND status = 'active' AND assigned_agent_id = ?",
        )
        .bind(to_agent)
        .bind(now)
        .bind(session_id)
        .bind(from_agent)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if moved == 0 {
            tx.rollback().await?;
            Self::require_session(self.session_by_id(session_id).await?)?;
            return Err(StoreError::NotAssigned);
        }

        // Transfer requires full availability from the target, not just
        // capacity: a busy agent cannot receive chats.
        let reserved = sqlx::query(
            "UPDATE agent_presence
             SET current_chats = current_chats + 1, last_active_at = ?
             WHERE user_id = ? AND state = 'online' AND current_chats < max_chats",
        )
        .bind(now)
        .bind(to_agent)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if reserved == 0 {
            tx.rollback().await?;
            return Err(self.classify_capacity_failure(to_agent, true).await?);
        }

        sqlx::query(
            "UPDATE agent_presence
             SET current_chats = MAX(current_chats - 1, 0)
             WHERE user_id = ?",
        )
        .bind(from_agent)
        .execute(&mut *tx)
        .await?;

        let target_name: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE id = ?")
            .bind(to_agent)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(target_name) = target_name else {
            tx.rollback().await?;
            return Err(StoreError::AgentNotFound);
        };

        let note = format!("Chat transferred to {target_name}");
        let message = insert_message_tx(&mut tx, &system_message(session_id, &note), now).await?;
        tx.commit().await?;

        let session = Self::require_session(self.session_by_id(session_id).await?)?;
        Ok((session, message))
    }

    /// Put all of an agent's active sessions back on the waiting queue and
    /// zero the released capacity. Used when operators enable re-queueing on
    /// agent disconnect.
    pub async fn requeue_sessions_for_agent(&self, agent_id: i64) -> Result<Vec<ChatSession>> {
        let now = now_ms();
        let mut tx = self.pool().begin().await?;

        let ids: Vec<(String,)> = sqlx::query_as(
            "UPDATE chat_sessions
             SET status = 'waiting', assigned_agent_id = NULL, assigned_at = NULL
             WHERE status = 'active' AND assigned_agent_id = ?
             RETURNING id",
        )
        .bind(agent_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE agent_presence
             SET current_chats = (
                 SELECT COUNT(*) FROM chat_sessions
                 WHERE status = 'active' AND assigned_agent_id = ?
             )
             WHERE user_id = ?",
        )
        .bind(agent_id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        for (id,) in &ids {
            insert_message_tx(&mut tx, &system_message(id, REQUEUED_MESSAGE), now).await?;
        }
        tx.commit().await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for (id,) in ids {
            if let Some(session) = self.session_by_id(&id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Rating may only be attached to a resolved session.
    pub async fn set_rating(
        &self,
        session_id: &str,
        rating: i64,
        feedback: Option<&str>,
    ) -> Result<ChatSession> {
        if !(1..=5).contains(&rating) {
            return Err(StoreError::InvalidRating);
        }

        let updated = sqlx::query(
            "UPDATE chat_sessions
             SET rating = ?, feedback = ?
             WHERE id = ? AND status = 'resolved'",
        )
        .bind(rating)
        .bind(feedback)
        .bind(session_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            Self::require_session(self.session_by_id(session_id).await?)?;
            return Err(StoreError::NotResolved);
        }
        Self::require_session(self.session_by_id(session_id).await?)
    }

    /// The waiting queue, FIFO by creation time.
    pub async fn waiting_sessions(&self) -> Result<Vec<ChatSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLS} FROM chat_sessions
             WHERE status = 'waiting'
             ORDER BY created_at, id"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    /// 1-indexed position in the waiting queue; `None` when not waiting.
    pub async fn queue_position(&self, session_id: &str) -> Result<Option<i64>> {
        let session = match self.session_by_id(session_id).await? {
            Some(s) if s.status == SessionStatus::Waiting => s,
            Some(_) => return Ok(None),
            None => return Err(StoreError::SessionNotFound),
        };

        let position: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_sessions
             WHERE status = 'waiting'
               AND (created_at < ? OR (created_at = ? AND id <= ?))",
        )
        .bind(session.created_at)
        .bind(session.created_at)
        .bind(&session.id)
        .fetch_one(self.pool())
        .await?;
        Ok(Some(position))
    }

    pub async fn active_sessions_for_agent(&self, agent_id: i64) -> Result<Vec<ChatSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLS} FROM chat_sessions
             WHERE status = 'active' AND assigned_agent_id = ?
             ORDER BY assigned_at, id"
        ))
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    /// Terminal sessions for history views, newest first.
    pub async fn recent_closed_sessions(&self, limit: i64) -> Result<Vec<ChatSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLS} FROM chat_sessions
             WHERE status IN ('resolved', 'abandoned')
             ORDER BY resolved_at DESC
             LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    /// Waiting/active sessions with no message newer than `cutoff_ms`. The
    /// session creation time stands in when the transcript is empty.
    pub async fn idle_sessions(&self, cutoff_ms: i64) -> Result<Vec<ChatSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLS} FROM chat_sessions s
             WHERE s.status IN ('waiting', 'active')
               AND COALESCE(
                   (SELECT MAX(m.created_at) FROM chat_messages m WHERE m.session_id = s.id),
                   s.created_at
               ) <= ?
             ORDER BY s.created_at, s.id"
        ))
        .bind(cutoff_ms)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    /// Count of sessions by status, for the stats feed.
    pub async fn count_by_status(&self, status: SessionStatus) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }

    /// Map a failed capacity reservation onto the caller-facing error by
    /// inspecting the presence row after rollback.
    async fn classify_capacity_failure(
        &self,
        agent_id: i64,
        transfer_target: bool,
    ) -> Result<StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM agent_presence WHERE user_id = ?")
                .bind(agent_id)
                .fetch_optional(self.pool())
                .await?;

        Ok(match row {
            None => StoreError::AgentNotFound,
            Some((state,)) => {
                let offline = if transfer_target {
                    state != "online"
                } else {
                    state == "offline"
                };
                match (offline, transfer_target) {
                    (true, true) => StoreError::TargetNotOnline,
                    (true, false) => StoreError::NotOnline,
                    (false, true) => StoreError::TargetAtCapacity,
                    (false, false) => StoreError::AtCapacity,
                }
            },
        })
    }
}
