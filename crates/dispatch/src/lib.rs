//! Waiting queue dispatcher and idle reaper.
//!
//! The queue itself is a query over the store; this crate owns the loop that
//! moves its head onto available agents and the periodic task that abandons
//! silent sessions. Both publish their side effects through the broker.

pub mod events;
pub mod reaper;

pub use reaper::IdleReaper;

use std::sync::Arc;

use {
    livedesk_broker::Broker,
    livedesk_config::ChatConfig,
    livedesk_presence::{PresenceRegistry, ReserveOutcome},
    livedesk_store::{AgentPresence, ChatStore, StoreError},
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

/// Moves waiting sessions onto available agents, least-loaded first.
pub struct Dispatcher {
    store: ChatStore,
    presence: Arc<PresenceRegistry>,
    broker: Arc<Broker>,
    config: ChatConfig,
    wakeup: Notify,
}

impl Dispatcher {
    pub fn new(
        store: ChatStore,
        presence: Arc<PresenceRegistry>,
        broker: Arc<Broker>,
        config: ChatConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            presence,
            broker,
            config,
            wakeup: Notify::new(),
        })
    }

    /// Nudge the loop: a session entered the queue, an agent came online, or
    /// capacity was released. Wakeups coalesce.
    pub fn trigger(&self) {
        self.wakeup.notify_one();
    }

    /// Run until cancelled. Each wakeup drains as much of the queue as the
    /// current agent pool allows.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            auto_assign = self.config.auto_assign_enabled,
            "dispatcher started"
        );
        loop {
            tokio::select! {
                _ = self.wakeup.notified() => {
                    if let Err(e) = self.drain().await {
                        warn!(error = %e, "dispatch pass failed");
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("dispatcher stopped");
                    return;
                },
            }
        }
    }

    /// One dispatch pass: repeatedly place the queue head until the queue is
    /// empty or nobody can take more work.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        if !self.config.auto_assign_enabled {
            return Ok(0);
        }

        let mut placed = 0;
        'queue: for session in self.store.waiting_sessions().await? {
            loop {
                let Some(agent) = self.select_agent().await else {
                    break 'queue;
                };
                if self.presence.reserve(agent.user_id).await != ReserveOutcome::Reserved {
                    // Raced with a manual accept or a status change; pick again.
                    continue;
                }
                match self.store.assign_session(&session.id, agent.user_id).await {
                    Ok((assigned, joined)) => {
                        debug!(
                            session_id = %assigned.id,
                            agent_id = agent.user_id,
                            "auto-assigned"
                        );
                        events::announce_assignment(&self.broker, &assigned, &agent, &joined);
                        placed += 1;
                        break;
                    },
                    Err(StoreError::AlreadyAssigned) => {
                        // Someone claimed it first; move to the next head.
                        self.presence.release(agent.user_id).await;
                        continue 'queue;
                    },
                    Err(StoreError::AtCapacity | StoreError::NotOnline) => {
                        // The cache was ahead of the store; repair and re-select.
                        self.presence.release(agent.user_id).await;
                        if let Err(e) = self.presence.resync(agent.user_id, &self.store).await {
                            warn!(agent_id = agent.user_id, error = %e, "presence resync failed");
                        }
                        continue;
                    },
                    Err(e) => {
                        self.presence.release(agent.user_id).await;
                        return Err(e);
                    },
                }
            }
        }

        if placed > 0 {
            events::publish_queue_refresh(&self.broker, &self.store).await?;
            events::publish_stats(&self.broker, &self.store, &self.presence).await?;
        }
        Ok(placed)
    }

    /// Lowest `current_chats` wins; ties go to the agent idle the longest so
    /// recently-busy agents are not hammered.
    async fn select_agent(&self) -> Option<AgentPresence> {
        self.presence
            .available_agents()
            .await
            .into_iter()
            .min_by_key(|a| (a.current_chats, a.last_active_at, a.user_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        livedesk_broker::Topic,
        livedesk_store::{AgentState, CreateSession, SessionStatus, run_migrations},
    };

    struct Harness {
        store: ChatStore,
        presence: Arc<PresenceRegistry>,
        broker: Arc<Broker>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("chat.db").display());
        let pool = livedesk_store::connect(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        Harness {
            store: ChatStore::new(pool),
            presence: Arc::new(PresenceRegistry::new()),
            broker: Arc::new(Broker::new()),
            _dir: dir,
        }
    }

    impl Harness {
        fn dispatcher(&self) -> Arc<Dispatcher> {
            Dispatcher::new(
                self.store.clone(),
                Arc::clone(&self.presence),
                Arc::clone(&self.broker),
                ChatConfig::default(),
            )
        }

        async fn seed_agent(&self, name: &str, max_chats: i64, state: AgentState) -> i64 {
            let email = format!("{}@example.test", name.to_lowercase());
            let id = self
                .store
                .insert_user(name, &email, "cs", None)
                .await
                .unwrap();
            self.store.upsert_presence(id, max_chats).await.unwrap();
            self.store.set_agent_state(id, state).await.unwrap();
            self.presence.rehydrate(&self.store).await.unwrap();
            id
        }

        async fn waiting_session(&self) -> String {
            self.store
                .create_session(CreateSession::default())
                .await
                .unwrap()
                .id
        }
    }

    #[tokio::test]
    async fn drains_queue_onto_available_agent() {
        let h = harness().await;
        let agent = h.seed_agent("Ana", 5, AgentState::Online).await;
        let s1 = h.waiting_session().await;
        let s2 = h.waiting_session().await;

        let placed = h.dispatcher().drain().await.unwrap();
        assert_eq!(placed, 2);

        for id in [&s1, &s2] {
            let session = h.store.session_by_id(id).await.unwrap().unwrap();
            assert_eq!(session.status, SessionStatus::Active);
            assert_eq!(session.assigned_agent_id, Some(agent));
        }
        assert_eq!(h.presence.get(agent).await.unwrap().current_chats, 2);
    }

    #[tokio::test]
    async fn prefers_least_loaded_agent() {
        let h = harness().await;
        let busy = h.seed_agent("Ana", 5, AgentState::Online).await;
        let idle = h.seed_agent("Bea", 5, AgentState::Online).await;

        // Load Ana with one chat first.
        let warmup = h.waiting_session().await;
        h.store.assign_session(&warmup, busy).await.unwrap();
        h.presence.rehydrate(&h.store).await.unwrap();

        let s = h.waiting_session().await;
        h.dispatcher().drain().await.unwrap();

        let session = h.store.session_by_id(&s).await.unwrap().unwrap();
        assert_eq!(session.assigned_agent_id, Some(idle));
    }

    #[tokio::test]
    async fn equal_load_goes_to_longest_idle() {
        let h = harness().await;
        let recent = h.seed_agent("Ana", 5, AgentState::Online).await;
        let stale = h.seed_agent("Bea", 5, AgentState::Online).await;

        sqlx::query("UPDATE agent_presence SET last_active_at = ? WHERE user_id = ?")
            .bind(1_000i64)
            .bind(stale)
            .execute(h.store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE agent_presence SET last_active_at = ? WHERE user_id = ?")
            .bind(2_000i64)
            .bind(recent)
            .execute(h.store.pool())
            .await
            .unwrap();
        h.presence.rehydrate(&h.store).await.unwrap();

        let s = h.waiting_session().await;
        h.dispatcher().drain().await.unwrap();

        let session = h.store.session_by_id(&s).await.unwrap().unwrap();
        assert_eq!(session.assigned_agent_id, Some(stale));
    }

    #[tokio::test]
    async fn leaves_queue_untouched_without_agents() {
        let h = harness().await;
        h.seed_agent("Ana", 5, AgentState::Busy).await;
        let s = h.waiting_session().await;

        let placed = h.dispatcher().drain().await.unwrap();
        assert_eq!(placed, 0);
        let session = h.store.session_by_id(&s).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn respects_auto_assign_switch() {
        let h = harness().await;
        h.seed_agent("Ana", 5, AgentState::Online).await;
        h.waiting_session().await;

        let dispatcher = Dispatcher::new(
            h.store.clone(),
            Arc::clone(&h.presence),
            Arc::clone(&h.broker),
            ChatConfig {
                auto_assign_enabled: false,
                ..Default::default()
            },
        );
        assert_eq!(dispatcher.drain().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stops_at_pool_capacity_and_keeps_fifo_tail() {
        let h = harness().await;
        let agent = h.seed_agent("Ana", 1, AgentState::Online).await;
        let first = h.waiting_session().await;
        let second = h.waiting_session().await;
        sqlx::query("UPDATE chat_sessions SET created_at = 1000 WHERE id = ?")
            .bind(&first)
            .execute(h.store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE chat_sessions SET created_at = 2000 WHERE id = ?")
            .bind(&second)
            .execute(h.store.pool())
            .await
            .unwrap();

        let placed = h.dispatcher().drain().await.unwrap();
        assert_eq!(placed, 1);

        // FIFO: the older session got the only slot.
        let first = h.store.session_by_id(&first).await.unwrap().unwrap();
        assert_eq!(first.assigned_agent_id, Some(agent));
        let second = h.store.session_by_id(&second).await.unwrap().unwrap();
        assert_eq!(second.status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn announces_assignment_on_session_topic() {
        let h = harness().await;
        h.seed_agent("Ana", 5, AgentState::Online).await;
        let s = h.waiting_session().await;

        let customer = h.broker.register_connection("cust-1");
        h.broker.subscribe("cust-1", &Topic::session(&s));

        h.dispatcher().drain().await.unwrap();

        let mut saw_assigned = false;
        while let Some(frame) = customer.try_pop() {
            if frame.json.contains("chat:assigned") {
                assert!(frame.json.contains("Ana"));
                saw_assigned = true;
            }
        }
        assert!(saw_assigned);
    }

    #[tokio::test]
    async fn trigger_wakes_the_run_loop() {
        let h = harness().await;
        let agent = h.seed_agent("Ana", 5, AgentState::Online).await;
        let s = h.waiting_session().await;

        let dispatcher = h.dispatcher();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(shutdown.clone()));

        dispatcher.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let session = h.store.session_by_id(&s).await.unwrap().unwrap();
                if session.assigned_agent_id == Some(agent) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap();
    }
}
