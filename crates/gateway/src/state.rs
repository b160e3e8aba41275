use std::{collections::HashMap, sync::Arc};

use {
    livedesk_broker::Broker,
    livedesk_chat::ChatService,
    livedesk_config::LivedeskConfig,
    livedesk_dispatch::Dispatcher,
    livedesk_presence::PresenceRegistry,
    livedesk_store::ChatStore,
    tokio::sync::RwLock,
};

use crate::auth::Authenticator;

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    pub store: ChatStore,
    pub presence: Arc<PresenceRegistry>,
    pub broker: Arc<Broker>,
    pub dispatcher: Arc<Dispatcher>,
    pub chat: Arc<ChatService>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: LivedeskConfig,
    /// Open connections per agent, so the disconnect hook fires only when the
    /// last window closes.
    agent_conns: RwLock<HashMap<i64, usize>>,
}

impl GatewayState {
    pub fn new(
        store: ChatStore,
        presence: Arc<PresenceRegistry>,
        broker: Arc<Broker>,
        dispatcher: Arc<Dispatcher>,
        chat: Arc<ChatService>,
        authenticator: Arc<dyn Authenticator>,
        config: LivedeskConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            presence,
            broker,
            dispatcher,
            chat,
            authenticator,
            config,
            agent_conns: RwLock::new(HashMap::new()),
        })
    }

    pub async fn agent_connected(&self, user_id: i64) -> usize {
        let mut conns = self.agent_conns.write().await;
        let count = conns.entry(user_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns true when this was the agent's last open connection.
    pub async fn agent_disconnected(&self, user_id: i64) -> bool {
        let mut conns = self.agent_conns.write().await;
        match conns.get_mut(&user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            },
            Some(_) => {
                conns.remove(&user_id);
                true
            },
            None => true,
        }
    }
}
