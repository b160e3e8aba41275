use std::sync::Arc;

use {
    livedesk_broker::{Broker, Topic},
    livedesk_config::ChatConfig,
    livedesk_dispatch::{Dispatcher, events},
    livedesk_presence::PresenceRegistry,
    livedesk_protocol::{
        Envelope, MAX_MESSAGE_CHARS,
        payloads::{
            EndChatParams, RatingParams, ResolveChatParams, SendMessageParams, StartChatParams,
            TransferChatParams, TypingParams,
        },
        server_events,
    },
    livedesk_store::{
        AgentPresence, AgentState, ChatMessage, ChatSession, ChatStore, CreateSession,
        MessageKind, NewMessage, SenderType, SessionStatus, StoreError,
        sessions::CUSTOMER_LEFT_MESSAGE,
    },
    serde_json::json,
    tracing::{debug, info, warn},
};

use crate::error::{ChatError, FailureKind, map_store_error};

type Result<T> = std::result::Result<T, ChatError>;

/// What an agent's fresh connection needs to pick up where it left off.
pub struct AgentConnection {
    pub presence: AgentPresence,
    pub active_sessions: Vec<ChatSession>,
}

/// The session state machine, shared by the WebSocket dispatch table and the
/// REST support surface.
pub struct ChatService {
    store: ChatStore,
    presence: Arc<PresenceRegistry>,
    broker: Arc<Broker>,
    dispatcher: Arc<Dispatcher>,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(
        store: ChatStore,
        presence: Arc<PresenceRegistry>,
        broker: Arc<Broker>,
        dispatcher: Arc<Dispatcher>,
        config: ChatConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            presence,
            broker,
            dispatcher,
            config,
        })
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    // ── Customer lifecycle ───────────────────────────────────────────────────

    /// `customer:start_chat`: create the session, tell the customer, put it
    /// on the queue and nudge the dispatcher.
    pub async fn start_chat(
        &self,
        conn_id: &str,
        params: StartChatParams,
    ) -> Result<ChatSession> {
        let session = self
            .store
            .create_session(CreateSession {
                customer_name: params.customer_name,
                customer_email: params.customer_email,
                source_url: params.source_url,
            })
            .await
            .map_err(|e| map_store_error(FailureKind::Init, e))?;

        self.broker.subscribe(conn_id, &Topic::session(&session.id));
        // The resume token goes to this connection only, never to a topic.
        self.broker.send_to(
            conn_id,
            &Envelope::new(
                server_events::CHAT_STARTED,
                json!({
                    "sessionId": session.id,
                    "customerToken": session.customer_token,
                    "session": session,
                }),
            ),
        );

        let position = self
            .store
            .queue_position(&session.id)
            .await
            .map_err(|e| map_store_error(FailureKind::Init, e))?
            .unwrap_or(1);
        self.broker.send_to(
            conn_id,
            &Envelope::new(
                server_events::CHAT_QUEUE_POSITION,
                json!({ "sessionId": session.id, "position": position }),
            ),
        );

        events::announce_new_chat(&self.broker, &session, position);
        self.refresh_stats().await;
        self.dispatcher.trigger();

        info!(session_id = %session.id, "chat started");
        Ok(session)
    }

    /// Re-bind a reconnecting customer and replay the transcript in a single
    /// `session:restored` frame. Status is untouched.
    pub async fn restore_session(&self, conn_id: &str, token: &str) -> Result<ChatSession> {
        let session = self
            .store
            .session_by_token(token)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?
            .ok_or(ChatError::SessionNotFound)?;

        self.broker.subscribe(conn_id, &Topic::session(&session.id));

        let messages = self
            .store
            .messages_for_session(&session.id)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?;
        let assigned_cs = match session.assigned_agent_id {
            Some(agent_id) => self
                .store
                .user_by_id(agent_id)
                .await
                .map_err(|e| map_store_error(FailureKind::Other, e))?
                .map(|u| json!({ "id": u.id, "name": u.name })),
            None => None,
        };

        self.broker.send_to(
            conn_id,
            &Envelope::new(
                server_events::SESSION_RESTORED,
                json!({
                    "sessionId": session.id,
                    "status": session.status,
                    "assignedCs": assigned_cs,
                    "messages": messages,
                }),
            ),
        );

        debug!(session_id = %session.id, "session restored");
        Ok(session)
    }

    /// `customer:send_message`: accepted while waiting or active so the
    /// transcript captures words said before an agent joins.
    pub async fn customer_message(
        &self,
        bound_session: Option<&str>,
        params: SendMessageParams,
    ) -> Result<ChatMessage> {
        if bound_session != Some(params.session_id.as_str()) {
            return Err(ChatError::InvalidSession);
        }
        let content = validate_content(&params.content)?;
        let message = self
            .store
            .append_message(NewMessage {
                session_id: params.session_id,
                sender_type: SenderType::Customer,
                sender_id: None,
                content,
                kind: parse_kind(params.message_type.as_deref()),
                file_ref: params.file_ref,
            })
            .await
            .map_err(|e| map_store_error(FailureKind::Send, e))?;

        events::publish_message(&self.broker, &message);
        Ok(message)
    }

    /// `cs:send_message`: only the assigned agent may write, and only while
    /// the session is active.
    pub async fn agent_message(
        &self,
        agent_id: i64,
        params: SendMessageParams,
    ) -> Result<ChatMessage> {
        let session = self.owned_active_session(agent_id, &params.session_id).await?;
        let content = validate_content(&params.content)?;
        let message = self
            .store
            .append_message(NewMessage {
                session_id: session.id,
                sender_type: SenderType::Agent,
                sender_id: Some(agent_id),
                content,
                kind: parse_kind(params.message_type.as_deref()),
                file_ref: params.file_ref,
            })
            .await
            .map_err(|e| map_store_error(FailureKind::Send, e))?;

        events::publish_message(&self.broker, &message);
        Ok(message)
    }

    /// `customer:typing`: best-effort; the broker may drop these.
    pub fn customer_typing(
        &self,
        bound_session: Option<&str>,
        params: TypingParams,
    ) -> Result<()> {
        if bound_session != Some(params.session_id.as_str()) {
            return Err(ChatError::InvalidSession);
        }
        self.broker.publish(
            &Topic::session(&params.session_id),
            &Envelope::new(
                server_events::CHAT_CUSTOMER_TYPING,
                json!({ "sessionId": params.session_id, "isTyping": params.is_typing }),
            ),
        );
        Ok(())
    }

    /// `cs:typing`.
    pub async fn agent_typing(&self, agent_id: i64, params: TypingParams) -> Result<()> {
        self.owned_active_session(agent_id, &params.session_id).await?;
        self.broker.publish(
            &Topic::session(&params.session_id),
            &Envelope::new(
                server_events::CHAT_CS_TYPING,
                json!({ "sessionId": params.session_id, "isTyping": params.is_typing }),
            ),
        );
        Ok(())
    }

    /// `customer:end_chat`. Ending an already-closed chat is a no-op so a
    /// double-click does not produce an error frame.
    pub async fn end_chat(
        &self,
        bound_session: Option<&str>,
        params: EndChatParams,
    ) -> Result<ChatSession> {
        if bound_session != Some(params.session_id.as_str()) {
            return Err(ChatError::InvalidSession);
        }
        match self
            .store
            .abandon_session(&params.session_id, CUSTOMER_LEFT_MESSAGE)
            .await
        {
            Ok((session, note, released_agent)) => {
                events::publish_message(&self.broker, &note);
                self.broker.publish(
                    &Topic::session(&session.id),
                    &Envelope::new(
                        server_events::CHAT_ENDED,
                        json!({ "sessionId": session.id, "reason": "customer_left" }),
                    ),
                );
                if let Some(agent_id) = released_agent {
                    self.presence.release(agent_id).await;
                    self.broker.publish(
                        &Topic::agent(agent_id),
                        &Envelope::new(
                            server_events::CHAT_CUSTOMER_LEFT,
                            json!({ "sessionId": session.id }),
                        ),
                    );
                }
                self.refresh_queue_and_stats().await;
                self.dispatcher.trigger();
                Ok(session)
            },
            Err(StoreError::TerminalSession) => self
                .store
                .session_by_id(&params.session_id)
                .await
                .map_err(|e| map_store_error(FailureKind::Other, e))?
                .ok_or(ChatError::SessionNotFound),
            Err(e) => Err(map_store_error(FailureKind::Other, e)),
        }
    }

    /// `customer:rating`: resolved sessions only.
    pub async fn rate_session(
        &self,
        bound_session: Option<&str>,
        params: RatingParams,
    ) -> Result<ChatSession> {
        if bound_session != Some(params.session_id.as_str()) {
            return Err(ChatError::InvalidSession);
        }
        self.store
            .set_rating(&params.session_id, params.rating, params.feedback.as_deref())
            .await
            .map_err(|e| map_store_error(FailureKind::Rating, e))
    }

    /// REST rating path, keyed by the resume token.
    pub async fn rate_by_token(
        &self,
        token: &str,
        rating: i64,
        feedback: Option<&str>,
    ) -> Result<ChatSession> {
        let session = self
            .store
            .session_by_token(token)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?
            .ok_or(ChatError::SessionNotFound)?;
        self.store
            .set_rating(&session.id, rating, feedback)
            .await
            .map_err(|e| map_store_error(FailureKind::Rating, e))
    }

    // ── Agent lifecycle ──────────────────────────────────────────────────────

    /// `cs:accept_chat`: manual claim with the agent pinned; identical
    /// atomicity to the dispatcher's claim.
    pub async fn accept_chat(&self, agent_id: i64, session_id: &str) -> Result<ChatSession> {
        let (session, joined) = self
            .store
            .assign_session(session_id, agent_id)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?;

        self.presence.apply_assignment(agent_id).await;
        let agent = self.agent_presence(agent_id).await?;
        events::announce_assignment(&self.broker, &session, &agent, &joined);
        self.refresh_queue_and_stats().await;
        self.audit(Some(agent_id), "accept_chat", &session.id).await;

        info!(session_id = %session.id, agent_id, "chat accepted");
        Ok(session)
    }

    /// `cs:resolve_chat`.
    pub async fn resolve_chat(
        &self,
        agent_id: i64,
        params: ResolveChatParams,
    ) -> Result<ChatSession> {
        let (session, note) = self
            .store
            .resolve_session(&params.session_id, agent_id)
            .await
            .map_err(|e| map_store_error(FailureKind::Resolve, e))?;

        self.presence.release(agent_id).await;
        events::publish_message(&self.broker, &note);

        let session_topic = Topic::session(&session.id);
        self.broker.publish(
            &session_topic,
            &Envelope::new(
                server_events::CHAT_ENDED,
                json!({ "sessionId": session.id, "reason": "resolved" }),
            ),
        );
        self.broker.publish(
            &Topic::agent(agent_id),
            &Envelope::new(
                server_events::CHAT_RESOLVED,
                json!({ "sessionId": session.id, "notes": params.notes }),
            ),
        );

        // The departing agent leaves the session topic.
        for conn in self.broker.conns_on_topic(&Topic::agent(agent_id)) {
            self.broker.unsubscribe(&conn, &session_topic);
        }

        self.refresh_queue_and_stats().await;
        self.dispatcher.trigger();
        self.audit(Some(agent_id), "resolve_chat", &session.id).await;

        info!(session_id = %session.id, agent_id, "chat resolved");
        Ok(session)
    }

    /// `cs:transfer_chat`: source keeps the chat on any failure.
    pub async fn transfer_chat(
        &self,
        agent_id: i64,
        params: TransferChatParams,
    ) -> Result<ChatSession> {
        let (session, note) = self
            .store
            .transfer_session(&params.session_id, agent_id, params.to_cs_id)
            .await
            .map_err(|e| map_store_error(FailureKind::Transfer, e))?;

        self.presence.release(agent_id).await;
        self.presence.apply_assignment(params.to_cs_id).await;
        let target = self.agent_presence(params.to_cs_id).await?;

        let session_topic = Topic::session(&session.id);
        let incoming = self.broker.conns_on_topic(&Topic::agent(target.user_id));
        self.broker.subscribe_many(&incoming, &session_topic);

        self.broker.publish(
            &session_topic,
            &Envelope::new(
                server_events::CHAT_TRANSFERRED,
                json!({
                    "sessionId": session.id,
                    "newCs": { "id": target.user_id, "name": target.name },
                }),
            ),
        );
        self.broker.publish(
            &Topic::agent(agent_id),
            &Envelope::new(
                server_events::CHAT_TRANSFERRED_OUT,
                json!({ "sessionId": session.id }),
            ),
        );
        self.broker.publish(
            &Topic::agent(target.user_id),
            &Envelope::new(
                server_events::CHAT_TRANSFERRED_IN,
                json!({ "sessionId": session.id, "session": session }),
            ),
        );
        events::publish_message(&self.broker, &note);

        for conn in self.broker.conns_on_topic(&Topic::agent(agent_id)) {
            self.broker.unsubscribe(&conn, &session_topic);
        }

        self.refresh_stats().await;
        self.audit(Some(agent_id), "transfer_chat", &session.id).await;

        info!(
            session_id = %session.id,
            from = agent_id,
            to = params.to_cs_id,
            "chat transferred"
        );
        Ok(session)
    }

    /// `cs:set_status`.
    pub async fn set_status(&self, agent_id: i64, status: &str) -> Result<AgentPresence> {
        let state = AgentState::parse(status)
            .map_err(|_| ChatError::Server(format!("unknown status '{status}'")))?;

        self.store
            .upsert_presence(agent_id, self.config.max_chats_per_cs as i64)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?;
        let row = self
            .store
            .set_agent_state(agent_id, state)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?;

        if self.presence.set_state(agent_id, state).await.is_none() {
            self.presence.register(row.clone()).await;
        }

        self.broker.publish(
            &Topic::queue(),
            &Envelope::new(
                server_events::CS_STATUS_CHANGED,
                json!({ "csId": agent_id, "status": state }),
            ),
        );
        self.refresh_stats().await;
        if state == AgentState::Online {
            self.dispatcher.trigger();
        }
        self.audit(Some(agent_id), "set_status", status).await;
        Ok(row)
    }

    /// Gateway connect hook: make sure a presence row exists and hand back
    /// what the connection should subscribe to.
    pub async fn agent_connect(&self, agent_id: i64) -> Result<AgentConnection> {
        self.store
            .upsert_presence(agent_id, self.config.max_chats_per_cs as i64)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?;
        let presence = self
            .store
            .presence_for_agent(agent_id)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?
            .ok_or_else(|| ChatError::Server("presence row missing after upsert".into()))?;
        self.presence.register(presence.clone()).await;

        let active_sessions = self
            .store
            .active_sessions_for_agent(agent_id)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?;

        Ok(AgentConnection {
            presence,
            active_sessions,
        })
    }

    /// Gateway disconnect hook, called when the agent's last connection
    /// closes. The agent goes offline; in-flight chats stay assigned unless
    /// the operator opted into re-queueing.
    pub async fn agent_disconnect(&self, agent_id: i64) {
        if let Err(e) = self.store.set_agent_state(agent_id, AgentState::Offline).await {
            warn!(agent_id, error = %e, "failed to persist offline state");
        }
        self.presence.set_state(agent_id, AgentState::Offline).await;

        self.broker.publish(
            &Topic::queue(),
            &Envelope::new(
                server_events::CS_STATUS_CHANGED,
                json!({ "csId": agent_id, "status": AgentState::Offline }),
            ),
        );

        if self.config.requeue_on_agent_disconnect {
            match self.store.requeue_sessions_for_agent(agent_id).await {
                Ok(requeued) if !requeued.is_empty() => {
                    info!(agent_id, count = requeued.len(), "re-queued chats of disconnected agent");
                    if let Err(e) = self.presence.resync(agent_id, &self.store).await {
                        warn!(agent_id, error = %e, "presence resync failed");
                    }
                    self.refresh_queue_and_stats().await;
                    self.dispatcher.trigger();
                },
                Ok(_) => {},
                Err(e) => warn!(agent_id, error = %e, "re-queue on disconnect failed"),
            }
        }

        self.refresh_stats().await;
    }

    // ── Admin ────────────────────────────────────────────────────────────────

    /// `admin:subscribe_stats`: push a fresh snapshot to the caller.
    pub async fn stats_snapshot(&self, conn_id: &str) -> Result<()> {
        let waiting = self
            .store
            .count_by_status(SessionStatus::Waiting)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?;
        let active = self
            .store
            .count_by_status(SessionStatus::Active)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?;
        let agents = self.presence.snapshot().await;

        self.broker.send_to(
            conn_id,
            &Envelope::new(
                server_events::STATS_UPDATE,
                json!({
                    "waiting": waiting,
                    "active": active,
                    "agentsOnline": agents.iter().filter(|a| a.state != AgentState::Offline).count(),
                    "agents": agents,
                }),
            ),
        );
        Ok(())
    }

    /// `admin:force_assign`: manual-accept semantics pinned to the target.
    pub async fn force_assign(
        &self,
        admin_id: i64,
        session_id: &str,
        cs_id: i64,
    ) -> Result<ChatSession> {
        let session = self.accept_chat(cs_id, session_id).await?;
        self.audit(Some(admin_id), "force_assign", &session.id).await;
        Ok(session)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn owned_active_session(&self, agent_id: i64, session_id: &str) -> Result<ChatSession> {
        let session = self
            .store
            .session_by_id(session_id)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?
            .ok_or(ChatError::SessionNotFound)?;
        if session.status != SessionStatus::Active
            || session.assigned_agent_id != Some(agent_id)
        {
            return Err(ChatError::NotAssigned);
        }
        Ok(session)
    }

    async fn agent_presence(&self, agent_id: i64) -> Result<AgentPresence> {
        if let Some(p) = self.presence.get(agent_id).await {
            return Ok(p);
        }
        self.store
            .presence_for_agent(agent_id)
            .await
            .map_err(|e| map_store_error(FailureKind::Other, e))?
            .ok_or(ChatError::NotOnline)
    }

    async fn refresh_queue_and_stats(&self) {
        if let Err(e) = events::publish_queue_refresh(&self.broker, &self.store).await {
            warn!(error = %e, "queue refresh failed");
        }
        self.refresh_stats().await;
    }

    async fn refresh_stats(&self) {
        if let Err(e) = events::publish_stats(&self.broker, &self.store, &self.presence).await {
            warn!(error = %e, "stats publish failed");
        }
    }

    /// The audit trail never fails the audited operation.
    async fn audit(&self, user_id: Option<i64>, action: &str, detail: &str) {
        if let Err(e) = self.store.log_activity(user_id, action, Some(detail)).await {
            warn!(action, error = %e, "activity log write failed");
        }
    }
}

fn validate_content(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    // Bound the body; clients are expected to enforce the same limit.
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Ok(trimmed.chars().take(MAX_MESSAGE_CHARS).collect());
    }
    Ok(trimmed.to_string())
}

fn parse_kind(message_type: Option<&str>) -> MessageKind {
    match message_type {
        Some("image") => MessageKind::Image,
        Some("file") => MessageKind::File,
        _ => MessageKind::Text,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, livedesk_broker::OutboundQueue, livedesk_store::run_migrations};

    struct Harness {
        service: Arc<ChatService>,
        store: ChatStore,
        presence: Arc<PresenceRegistry>,
        broker: Arc<Broker>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        harness_with(ChatConfig::default()).await
    }

    async fn harness_with(config: ChatConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("chat.db").display());
        let pool = livedesk_store::connect(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = ChatStore::new(pool);
        let presence = Arc::new(PresenceRegistry::new());
        let broker = Arc::new(Broker::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::clone(&presence),
            Arc::clone(&broker),
            // Keep auto-assignment out of service tests; the dispatcher loop
            // is not running, so triggers are inert anyway.
            ChatConfig {
                auto_assign_enabled: false,
                ..config.clone()
            },
        );
        let service = ChatService::new(
            store.clone(),
            Arc::clone(&presence),
            Arc::clone(&broker),
            dispatcher,
            config,
        );
        Harness {
            service,
            store,
            presence,
            broker,
            _dir: dir,
        }
    }

    impl Harness {
        /// Seed an online agent with a registered broker connection.
        async fn online_agent(&self, name: &str, conn_id: &str) -> (i64, Arc<OutboundQueue>) {
            let email = format!("{}@example.test", name.to_lowercase());
            let id = self
                .store
                .insert_user(name, &email, "cs", None)
                .await
                .unwrap();
            let queue = self.broker.register_connection(conn_id);
            self.broker.subscribe(conn_id, &Topic::agent(id));
            self.broker.subscribe(conn_id, &Topic::queue());
            self.service.agent_connect(id).await.unwrap();
            self.service.set_status(id, "online").await.unwrap();
            (id, queue)
        }

        fn customer_conn(&self, conn_id: &str) -> Arc<OutboundQueue> {
            self.broker.register_connection(conn_id)
        }
    }

    fn drain(queue: &OutboundQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.try_pop().map(|f| f.json)).collect()
    }

    fn events_in(frames: &[String], event: &str) -> usize {
        frames.iter().filter(|f| f.contains(event)).count()
    }

    #[tokio::test]
    async fn start_chat_tells_customer_and_queue() {
        let h = harness().await;
        let (_, agent_queue) = h.online_agent("Ana", "agent-1").await;
        let customer = h.customer_conn("cust-1");

        let session = h
            .service
            .start_chat("cust-1", StartChatParams {
                customer_name: Some("Ada".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);

        let frames = drain(&customer);
        assert_eq!(events_in(&frames, "chat:started"), 1);
        assert!(frames[0].contains(&session.customer_token));
        assert_eq!(events_in(&frames, "chat:queue_position"), 1);
        assert!(frames.iter().any(|f| f.contains("\"position\":1")));

        let agent_frames = drain(&agent_queue);
        assert!(events_in(&agent_frames, "queue:new_chat") >= 1);
    }

    #[tokio::test]
    async fn customer_message_requires_binding() {
        let h = harness().await;
        let customer = h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        drain(&customer);

        let err = h
            .service
            .customer_message(Some("other-session"), SendMessageParams {
                session_id: session.id.clone(),
                content: "hi".into(),
                message_type: None,
                file_ref: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SESSION");

        let err = h
            .service
            .customer_message(Some(session.id.as_str()), SendMessageParams {
                session_id: session.id.clone(),
                content: "   ".into(),
                message_type: None,
                file_ref: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EMPTY_MESSAGE");

        let msg = h
            .service
            .customer_message(Some(session.id.as_str()), SendMessageParams {
                session_id: session.id.clone(),
                content: "  hello  ".into(),
                message_type: None,
                file_ref: None,
            })
            .await
            .unwrap();
        assert_eq!(msg.content, "hello");

        let frames = drain(&customer);
        assert_eq!(events_in(&frames, "chat:message"), 1);
    }

    #[tokio::test]
    async fn oversized_content_is_clamped() {
        let h = harness().await;
        let customer = h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        drain(&customer);

        let long = "x".repeat(MAX_MESSAGE_CHARS + 500);
        let msg = h
            .service
            .customer_message(Some(session.id.as_str()), SendMessageParams {
                session_id: session.id.clone(),
                content: long,
                message_type: None,
                file_ref: None,
            })
            .await
            .unwrap();
        assert_eq!(msg.content.chars().count(), MAX_MESSAGE_CHARS);
    }

    #[tokio::test]
    async fn accept_notifies_both_sides_and_joins_the_topic() {
        let h = harness().await;
        let (agent, agent_queue) = h.online_agent("Ana", "agent-1").await;
        let customer = h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        drain(&customer);
        drain(&agent_queue);

        let accepted = h.service.accept_chat(agent, &session.id).await.unwrap();
        assert_eq!(accepted.status, SessionStatus::Active);
        assert_eq!(accepted.assigned_agent_id, Some(agent));

        let customer_frames = drain(&customer);
        assert_eq!(events_in(&customer_frames, "chat:assigned"), 1);
        assert!(customer_frames.iter().any(|f| f.contains("Ana")));

        let agent_frames = drain(&agent_queue);
        assert_eq!(events_in(&agent_frames, "chat:new_assigned"), 1);

        // The agent connection is now on the session topic: it sees messages.
        h.service
            .customer_message(Some(session.id.as_str()), SendMessageParams {
                session_id: session.id.clone(),
                content: "hi".into(),
                message_type: None,
                file_ref: None,
            })
            .await
            .unwrap();
        let agent_frames = drain(&agent_queue);
        assert_eq!(events_in(&agent_frames, "chat:message"), 1);
    }

    #[tokio::test]
    async fn second_accept_loses_with_already_assigned() {
        let h = harness().await;
        let (a1, _) = h.online_agent("Ana", "agent-1").await;
        let (a2, _) = h.online_agent("Bea", "agent-2").await;
        h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();

        h.service.accept_chat(a1, &session.id).await.unwrap();
        let err = h.service.accept_chat(a2, &session.id).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_ASSIGNED");

        assert_eq!(h.presence.get(a1).await.unwrap().current_chats, 1);
        assert_eq!(h.presence.get(a2).await.unwrap().current_chats, 0);
    }

    #[tokio::test]
    async fn accept_at_capacity_is_rejected() {
        let h = harness().await;
        let config = ChatConfig {
            max_chats_per_cs: 1,
            ..Default::default()
        };
        let h2 = harness_with(config).await;
        drop(h);

        let (agent, _) = h2.online_agent("Ana", "agent-1").await;
        h2.customer_conn("cust-1");
        h2.customer_conn("cust-2");
        let first = h2
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        let second = h2
            .service
            .start_chat("cust-2", StartChatParams::default())
            .await
            .unwrap();

        h2.service.accept_chat(agent, &first.id).await.unwrap();
        let err = h2.service.accept_chat(agent, &second.id).await.unwrap_err();
        assert_eq!(err.code(), "AT_CAPACITY");
        assert_eq!(h2.presence.get(agent).await.unwrap().current_chats, 1);
    }

    #[tokio::test]
    async fn resolve_ends_the_chat_for_both_sides() {
        let h = harness().await;
        let (agent, agent_queue) = h.online_agent("Ana", "agent-1").await;
        let customer = h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        h.service.accept_chat(agent, &session.id).await.unwrap();
        drain(&customer);
        drain(&agent_queue);

        let resolved = h
            .service
            .resolve_chat(agent, ResolveChatParams {
                session_id: session.id.clone(),
                notes: Some("handled".into()),
            })
            .await
            .unwrap();
        assert_eq!(resolved.status, SessionStatus::Resolved);
        assert_eq!(h.presence.get(agent).await.unwrap().current_chats, 0);

        let customer_frames = drain(&customer);
        assert_eq!(events_in(&customer_frames, "chat:ended"), 1);
        assert!(customer_frames.iter().any(|f| f.contains("\"reason\":\"resolved\"")));

        let agent_frames = drain(&agent_queue);
        assert_eq!(events_in(&agent_frames, "chat:resolved"), 1);

        // Duplicate resolve: the session is no longer assigned-active.
        let err = h
            .service
            .resolve_chat(agent, ResolveChatParams {
                session_id: session.id.clone(),
                notes: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_ASSIGNED");
    }

    #[tokio::test]
    async fn transfer_routes_events_to_all_parties() {
        let h = harness().await;
        let (a1, q1) = h.online_agent("Ana", "agent-1").await;
        let (a2, q2) = h.online_agent("Bea", "agent-2").await;
        let customer = h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        h.service.accept_chat(a1, &session.id).await.unwrap();
        drain(&customer);
        drain(&q1);
        drain(&q2);

        let moved = h
            .service
            .transfer_chat(a1, TransferChatParams {
                session_id: session.id.clone(),
                to_cs_id: a2,
            })
            .await
            .unwrap();
        assert_eq!(moved.assigned_agent_id, Some(a2));
        assert_eq!(h.presence.get(a1).await.unwrap().current_chats, 0);
        assert_eq!(h.presence.get(a2).await.unwrap().current_chats, 1);

        let customer_frames = drain(&customer);
        assert_eq!(events_in(&customer_frames, "chat:transferred"), 1);
        assert!(customer_frames.iter().any(|f| f.contains("Bea")));

        let out_frames = drain(&q1);
        assert_eq!(events_in(&out_frames, "chat:transferred_out"), 1);
        let in_frames = drain(&q2);
        assert_eq!(events_in(&in_frames, "chat:transferred_in"), 1);
    }

    #[tokio::test]
    async fn transfer_to_unavailable_target_fails_cleanly() {
        let h = harness().await;
        let (a1, _) = h.online_agent("Ana", "agent-1").await;
        let (a2, _) = h.online_agent("Bea", "agent-2").await;
        h.service.set_status(a2, "busy").await.unwrap();
        h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        h.service.accept_chat(a1, &session.id).await.unwrap();

        let err = h
            .service
            .transfer_chat(a1, TransferChatParams {
                session_id: session.id.clone(),
                to_cs_id: a2,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TARGET_NOT_ONLINE");

        let after = h.store.session_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(after.assigned_agent_id, Some(a1));
    }

    #[tokio::test]
    async fn end_chat_is_idempotent() {
        let h = harness().await;
        h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();

        let ended = h
            .service
            .end_chat(Some(session.id.as_str()), EndChatParams {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(ended.status, SessionStatus::Abandoned);

        let again = h
            .service
            .end_chat(Some(session.id.as_str()), EndChatParams {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(again.status, SessionStatus::Abandoned);
        assert_eq!(again.resolved_at, ended.resolved_at);
    }

    #[tokio::test]
    async fn end_chat_releases_agent_and_notifies() {
        let h = harness().await;
        let (agent, agent_queue) = h.online_agent("Ana", "agent-1").await;
        h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        h.service.accept_chat(agent, &session.id).await.unwrap();
        drain(&agent_queue);

        h.service
            .end_chat(Some(session.id.as_str()), EndChatParams {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(h.presence.get(agent).await.unwrap().current_chats, 0);

        let frames = drain(&agent_queue);
        assert_eq!(events_in(&frames, "chat:customer_left"), 1);
    }

    #[tokio::test]
    async fn rating_requires_resolved_state() {
        let h = harness().await;
        let (agent, _) = h.online_agent("Ana", "agent-1").await;
        h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();

        let err = h
            .service
            .rate_session(Some(session.id.as_str()), RatingParams {
                session_id: session.id.clone(),
                rating: 5,
                feedback: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATING_FAILED");

        h.service.accept_chat(agent, &session.id).await.unwrap();
        h.service
            .resolve_chat(agent, ResolveChatParams {
                session_id: session.id.clone(),
                notes: None,
            })
            .await
            .unwrap();

        let err = h
            .service
            .rate_session(Some(session.id.as_str()), RatingParams {
                session_id: session.id.clone(),
                rating: 9,
                feedback: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_RATING");

        let rated = h
            .service
            .rate_by_token(&session.customer_token, 5, Some("great"))
            .await
            .unwrap();
        assert_eq!(rated.rating, Some(5));
    }

    #[tokio::test]
    async fn set_status_announces_on_queue_topic() {
        let h = harness().await;
        let (agent, agent_queue) = h.online_agent("Ana", "agent-1").await;
        drain(&agent_queue);

        h.service.set_status(agent, "busy").await.unwrap();
        let frames = drain(&agent_queue);
        assert!(frames.iter().any(|f| f.contains("cs:status_changed") && f.contains("busy")));

        let err = h.service.set_status(agent, "away").await.unwrap_err();
        assert_eq!(err.code(), "SERVER_ERROR");
    }

    #[tokio::test]
    async fn restore_replays_the_ordered_transcript() {
        let h = harness().await;
        let customer = h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        for text in ["first", "second", "third"] {
            h.service
                .customer_message(Some(session.id.as_str()), SendMessageParams {
                    session_id: session.id.clone(),
                    content: text.into(),
                    message_type: None,
                    file_ref: None,
                })
                .await
                .unwrap();
        }
        drain(&customer);

        // Reconnect on a fresh connection.
        let reconnect = h.customer_conn("cust-2");
        let restored = h
            .service
            .restore_session("cust-2", &session.customer_token)
            .await
            .unwrap();
        assert_eq!(restored.status, SessionStatus::Waiting);

        let frames = drain(&reconnect);
        assert_eq!(events_in(&frames, "session:restored"), 1);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        let messages = frame["data"]["messages"].as_array().unwrap();
        // Welcome + three customer messages, in append order.
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["content"], "first");
        assert_eq!(messages[3]["content"], "third");

        let err = h.service.restore_session("cust-2", "bogus").await.unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn disconnect_keeps_assignments_by_default() {
        let h = harness().await;
        let (agent, _) = h.online_agent("Ana", "agent-1").await;
        h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        h.service.accept_chat(agent, &session.id).await.unwrap();

        h.service.agent_disconnect(agent).await;

        let after = h.store.session_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(after.status, SessionStatus::Active);
        assert_eq!(after.assigned_agent_id, Some(agent));
        assert_eq!(h.presence.get(agent).await.unwrap().state, AgentState::Offline);
    }

    #[tokio::test]
    async fn disconnect_requeues_when_configured() {
        let h = harness_with(ChatConfig {
            requeue_on_agent_disconnect: true,
            ..Default::default()
        })
        .await;
        let (agent, _) = h.online_agent("Ana", "agent-1").await;
        h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        h.service.accept_chat(agent, &session.id).await.unwrap();

        h.service.agent_disconnect(agent).await;

        let after = h.store.session_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(after.status, SessionStatus::Waiting);
        assert!(after.assigned_agent_id.is_none());
        assert_eq!(h.presence.get(agent).await.unwrap().current_chats, 0);
    }

    #[tokio::test]
    async fn agent_typing_requires_ownership() {
        let h = harness().await;
        let (a1, _) = h.online_agent("Ana", "agent-1").await;
        let (a2, _) = h.online_agent("Bea", "agent-2").await;
        h.customer_conn("cust-1");
        let session = h
            .service
            .start_chat("cust-1", StartChatParams::default())
            .await
            .unwrap();
        h.service.accept_chat(a1, &session.id).await.unwrap();

        let err = h
            .service
            .agent_typing(a2, TypingParams {
                session_id: session.id.clone(),
                is_typing: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_ASSIGNED");

        h.service
            .agent_typing(a1, TypingParams {
                session_id: session.id.clone(),
                is_typing: true,
            })
            .await
            .unwrap();
    }
}
