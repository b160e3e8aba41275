//! Persisted agent presence. The in-memory registry mirrors these rows; the
//! lifecycle transactions in [`crate::sessions`] mutate `current_chats`
//! together with the session rows, so this table is always the authority.

use livedesk_common::now_ms;

use crate::{
    ChatStore, Result,
    error::StoreError,
    types::{AgentPresence, AgentState},
};

type PresenceRow = (i64, String, String, i64, i64, i64);

fn presence_from_row(row: PresenceRow) -> Result<AgentPresence> {
    Ok(AgentPresence {
        user_id: row.0,
        name: row.1,
        state: AgentState::parse(&row.2)?,
        current_chats: row.3,
        max_chats: row.4,
        last_active_at: row.5,
    })
}

const PRESENCE_SELECT: &str = "SELECT p.user_id, u.name, p.state, p.current_chats, p.max_chats, \
     p.last_active_at FROM agent_presence p JOIN users u ON u.id = p.user_id";

impl ChatStore {
    /// Ensure a presence row exists for the agent. An existing row keeps its
    /// counters but picks up a changed chat ceiling.
    pub async fn upsert_presence(&self, user_id: i64, max_chats: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_presence (user_id, state, current_chats, max_chats, last_active_at)
             VALUES (?, 'offline', 0, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET max_chats = excluded.max_chats",
        )
        .bind(user_id)
        .bind(max_chats)
        .bind(now_ms())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_agent_state(&self, user_id: i64, state: AgentState) -> Result<AgentPresence> {
        let updated = sqlx::query(
            "UPDATE agent_presence SET state = ?, last_active_at = ? WHERE user_id = ?",
        )
        .bind(state.as_str())
        .bind(now_ms())
        .bind(user_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::AgentNotFound);
        }
        self.presence_for_agent(user_id)
            .await?
            .ok_or(StoreError::AgentNotFound)
    }

    pub async fn presence_for_agent(&self, user_id: i64) -> Result<Option<AgentPresence>> {
        let row: Option<PresenceRow> =
            sqlx::query_as(&format!("{PRESENCE_SELECT} WHERE p.user_id = ?"))
                .bind(user_id)
                .fetch_optional(self.pool())
                .await?;
        row.map(presence_from_row).transpose()
    }

    pub async fn presence_snapshot(&self) -> Result<Vec<AgentPresence>> {
        let rows: Vec<PresenceRow> =
            sqlx::query_as(&format!("{PRESENCE_SELECT} ORDER BY p.user_id"))
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(presence_from_row).collect()
    }

    /// Recompute `current_chats` from the session set. Used to repair a
    /// suspected divergence between the cache and the store.
    pub async fn recount_agent_chats(&self, user_id: i64) -> Result<i64> {
        sqlx::query(
            "UPDATE agent_presence
             SET current_chats = (
                 SELECT COUNT(*) FROM chat_sessions
                 WHERE status = 'active' AND assigned_agent_id = ?
             )
             WHERE user_id = ?",
        )
        .bind(user_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;

        let count: Option<i64> =
            sqlx::query_scalar("SELECT current_chats FROM agent_presence WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(self.pool())
                .await?;
        count.ok_or(StoreError::AgentNotFound)
    }

    /// Shutdown flush: every agent goes offline. Capacity counters are left
    /// untouched; assignments survive restarts.
    pub async fn force_all_offline(&self) -> Result<u64> {
        let res = sqlx::query("UPDATE agent_presence SET state = 'offline' WHERE state != 'offline'")
            .execute(self.pool())
            .await?;
        Ok(res.rows_affected())
    }
}
