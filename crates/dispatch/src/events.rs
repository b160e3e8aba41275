//! Broker publications shared by the dispatcher, the reaper and the chat
//! layer, so manual and automatic paths emit identical frames.

use {
    livedesk_broker::{Broker, Topic},
    livedesk_presence::PresenceRegistry,
    livedesk_protocol::{Envelope, server_events},
    livedesk_store::{AgentPresence, ChatMessage, ChatSession, ChatStore, SessionStatus, StoreError},
    serde_json::json,
};

/// Everything that follows a successful claim: the new owner's open windows
/// join the session topic, both sides learn about the assignment, and the
/// join message reaches live subscribers.
pub fn announce_assignment(
    broker: &Broker,
    session: &ChatSession,
    agent: &AgentPresence,
    joined: &ChatMessage,
) {
    let session_topic = Topic::session(&session.id);
    let agent_topic = Topic::agent(agent.user_id);

    let agent_conns = broker.conns_on_topic(&agent_topic);
    broker.subscribe_many(&agent_conns, &session_topic);

    broker.publish(
        &session_topic,
        &Envelope::new(
            server_events::CHAT_ASSIGNED,
            json!({
                "sessionId": session.id,
                "cs": { "id": agent.user_id, "name": agent.name },
            }),
        ),
    );
    broker.publish(
        &agent_topic,
        &Envelope::new(
            server_events::CHAT_NEW_ASSIGNED,
            json!({
                "sessionId": session.id,
                "session": session,
            }),
        ),
    );
    publish_message(broker, joined);
}

/// Fan a persisted message out to the session topic. Clients suppress their
/// own sends by `senderType`.
pub fn publish_message(broker: &Broker, message: &ChatMessage) {
    broker.publish(
        &Topic::session(&message.session_id),
        &Envelope::new(server_events::CHAT_MESSAGE, json!({ "message": message })),
    );
}

/// A session just entered the queue.
pub fn announce_new_chat(broker: &Broker, session: &ChatSession, position: i64) {
    broker.publish(
        &Topic::queue(),
        &Envelope::new(
            server_events::QUEUE_NEW_CHAT,
            json!({
                "session": session,
                "position": position,
            }),
        ),
    );
}

/// Refresh the agent-facing queue view and each waiter's position.
pub async fn publish_queue_refresh(broker: &Broker, store: &ChatStore) -> Result<(), StoreError> {
    let waiting = store.waiting_sessions().await?;

    broker.publish(
        &Topic::queue(),
        &Envelope::new(
            server_events::QUEUE_UPDATE,
            json!({
                "count": waiting.len(),
                "sessions": waiting,
            }),
        ),
    );

    for (idx, session) in waiting.iter().enumerate() {
        broker.publish(
            &Topic::session(&session.id),
            &Envelope::new(
                server_events::CHAT_QUEUE_POSITION,
                json!({
                    "sessionId": session.id,
                    "position": idx + 1,
                }),
            ),
        );
    }
    Ok(())
}

/// Dashboard counters on `admin-stats`.
pub async fn publish_stats(
    broker: &Broker,
    store: &ChatStore,
    presence: &PresenceRegistry,
) -> Result<(), StoreError> {
    let waiting = store.count_by_status(SessionStatus::Waiting).await?;
    let active = store.count_by_status(SessionStatus::Active).await?;
    let agents = presence.snapshot().await;
    let online = agents
        .iter()
        .filter(|a| a.state != livedesk_store::AgentState::Offline)
        .count();

    broker.publish(
        &Topic::admin_stats(),
        &Envelope::new(
            server_events::STATS_UPDATE,
            json!({
                "waiting": waiting,
                "active": active,
                "agentsOnline": online,
                "agents": agents,
            }),
        ),
    );
    Ok(())
}
