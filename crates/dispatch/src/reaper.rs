//! Idle session reaper.
//!
//! Sessions with no message for `chat_idle_timeout_seconds` are abandoned,
//! whether an agent was attached or not. Customers who merely disconnected
//! keep their session alive until this fires; that is what makes reconnects
//! work.

use std::sync::Arc;

use {
    livedesk_broker::{Broker, Topic},
    livedesk_common::now_ms,
    livedesk_config::ChatConfig,
    livedesk_presence::PresenceRegistry,
    livedesk_protocol::{Envelope, server_events},
    livedesk_store::{ChatStore, StoreError, sessions::IDLE_CLOSE_MESSAGE},
    serde_json::json,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{Dispatcher, events};

pub struct IdleReaper {
    store: ChatStore,
    presence: Arc<PresenceRegistry>,
    broker: Arc<Broker>,
    dispatcher: Arc<Dispatcher>,
    config: ChatConfig,
}

impl IdleReaper {
    pub fn new(
        store: ChatStore,
        presence: Arc<PresenceRegistry>,
        broker: Arc<Broker>,
        dispatcher: Arc<Dispatcher>,
        config: ChatConfig,
    ) -> Self {
        Self {
            store,
            presence,
            broker,
            dispatcher,
            config,
        }
    }

    /// Scan on an interval until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reaper_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            idle_timeout_secs = self.config.chat_idle_timeout_seconds,
            "idle reaper started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "idle sweep failed");
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("idle reaper stopped");
                    return;
                },
            }
        }
    }

    /// One pass: abandon everything whose last activity is at or past the
    /// timeout. Returns how many sessions were closed.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let cutoff = now_ms() - self.config.idle_timeout_ms();
        let idle = self.store.idle_sessions(cutoff).await?;
        if idle.is_empty() {
            return Ok(0);
        }

        let mut reaped = 0;
        for session in idle {
            match self
                .store
                .abandon_session(&session.id, IDLE_CLOSE_MESSAGE)
                .await
            {
                Ok((_, note, released_agent)) => {
                    reaped += 1;
                    info!(session_id = %session.id, "session abandoned for inactivity");
                    events::publish_message(&self.broker, &note);
                    self.broker.publish(
                        &Topic::session(&session.id),
                        &Envelope::new(
                            server_events::CHAT_ENDED,
                            json!({ "sessionId": session.id, "reason": "idle" }),
                        ),
                    );
                    if let Some(agent_id) = released_agent {
                        self.presence.release(agent_id).await;
                        self.broker.publish(
                            &Topic::agent(agent_id),
                            &Envelope::new(
                                server_events::CHAT_ENDED,
                                json!({ "sessionId": session.id, "reason": "idle" }),
                            ),
                        );
                    }
                },
                // Lost a race with resolve/abandon; nothing to undo.
                Err(StoreError::TerminalSession) => {},
                Err(e) => return Err(e),
            }
        }

        if reaped > 0 {
            events::publish_queue_refresh(&self.broker, &self.store).await?;
            events::publish_stats(&self.broker, &self.store, &self.presence).await?;
            // Freed capacity may unblock the queue.
            self.dispatcher.trigger();
        }
        Ok(reaped)
    }
}
