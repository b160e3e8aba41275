//! In-memory agent presence and capacity registry.
//!
//! The registry is the fast-path view the dispatcher selects against; the
//! presence rows in the store stay authoritative because every lifecycle
//! transaction mutates them together with the session rows. After a commit
//! the caller syncs the cache with `apply_assignment`/`release`; on suspected
//! divergence `resync` recounts from the session set.

use std::collections::HashMap;

use {
    livedesk_common::now_ms,
    livedesk_store::{AgentPresence, AgentState, ChatStore, StoreError},
    serde::Serialize,
    tokio::sync::{RwLock, broadcast},
    tracing::{debug, warn},
};

/// Outcome of an in-memory capacity reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    AtCapacity,
    NotOnline,
}

/// Emitted on every state or capacity change; the chat layer forwards these
/// to the `queue` and `admin-stats` topics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub agent: AgentPresence,
}

pub struct PresenceRegistry {
    agents: RwLock<HashMap<i64, AgentPresence>>,
    changes: broadcast::Sender<PresenceChange>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            agents: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Load the persisted presence rows at startup.
    pub async fn rehydrate(&self, store: &ChatStore) -> Result<usize, StoreError> {
        let snapshot = store.presence_snapshot().await?;
        let mut agents = self.agents.write().await;
        agents.clear();
        for row in snapshot {
            agents.insert(row.user_id, row);
        }
        debug!(agents = agents.len(), "presence registry rehydrated");
        Ok(agents.len())
    }

    /// Insert or refresh an agent entry (gateway connect path).
    pub async fn register(&self, presence: AgentPresence) {
        let mut agents = self.agents.write().await;
        agents.insert(presence.user_id, presence.clone());
        drop(agents);
        self.emit(presence);
    }

    pub async fn get(&self, user_id: i64) -> Option<AgentPresence> {
        self.agents.read().await.get(&user_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<AgentPresence> {
        let mut all: Vec<AgentPresence> = self.agents.read().await.values().cloned().collect();
        all.sort_by_key(|a| a.user_id);
        all
    }

    /// Agents eligible for new assignments.
    pub async fn available_agents(&self) -> Vec<AgentPresence> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.is_available())
            .cloned()
            .collect()
    }

    pub async fn set_state(&self, user_id: i64, state: AgentState) -> Option<AgentPresence> {
        let mut agents = self.agents.write().await;
        let entry = agents.get_mut(&user_id)?;
        entry.state = state;
        entry.last_active_at = now_ms();
        let updated = entry.clone();
        drop(agents);
        self.emit(updated.clone());
        Some(updated)
    }

    /// Atomically take one unit of capacity if the agent is available.
    pub async fn reserve(&self, user_id: i64) -> ReserveOutcome {
        let mut agents = self.agents.write().await;
        let Some(entry) = agents.get_mut(&user_id) else {
            return ReserveOutcome::NotOnline;
        };
        if entry.state != AgentState::Online {
            return ReserveOutcome::NotOnline;
        }
        if entry.current_chats >= entry.max_chats {
            return ReserveOutcome::AtCapacity;
        }
        entry.current_chats += 1;
        entry.last_active_at = now_ms();
        let updated = entry.clone();
        drop(agents);
        self.emit(updated);
        ReserveOutcome::Reserved
    }

    /// Give one unit of capacity back; never goes below zero.
    pub async fn release(&self, user_id: i64) {
        let mut agents = self.agents.write().await;
        let Some(entry) = agents.get_mut(&user_id) else {
            return;
        };
        if entry.current_chats > 0 {
            entry.current_chats -= 1;
        }
        let updated = entry.clone();
        drop(agents);
        self.emit(updated);
    }

    /// Sync the cache after a store transaction that took capacity without a
    /// prior `reserve` (manual accept, transfer-in).
    pub async fn apply_assignment(&self, user_id: i64) {
        let mut agents = self.agents.write().await;
        let Some(entry) = agents.get_mut(&user_id) else {
            return;
        };
        if entry.current_chats < entry.max_chats {
            entry.current_chats += 1;
        }
        entry.last_active_at = now_ms();
        let updated = entry.clone();
        drop(agents);
        self.emit(updated);
    }

    /// Repair a suspected divergence by recounting from the store.
    pub async fn resync(&self, user_id: i64, store: &ChatStore) -> Result<i64, StoreError> {
        let count = store.recount_agent_chats(user_id).await?;
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(&user_id) {
            if entry.current_chats != count {
                warn!(
                    user_id,
                    cached = entry.current_chats,
                    actual = count,
                    "presence cache diverged; resynced"
                );
            }
            entry.current_chats = count;
            let updated = entry.clone();
            drop(agents);
            self.emit(updated);
        }
        Ok(count)
    }

    /// Shutdown flush: everyone offline, in memory and in the store.
    pub async fn flush_offline(&self, store: &ChatStore) -> Result<(), StoreError> {
        store.force_all_offline().await?;
        let mut agents = self.agents.write().await;
        for entry in agents.values_mut() {
            entry.state = AgentState::Offline;
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    fn emit(&self, agent: AgentPresence) {
        // No receivers is fine; the feed is best-effort.
        let _ = self.changes.send(PresenceChange { agent });
    }
}
