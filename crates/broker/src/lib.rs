//! Topic-indexed pub/sub fan-out to live connections.
//!
//! The broker delivers process-locally and best-effort; durability lives in
//! the store. Each connection owns a bounded outbound queue drained by its
//! write task. Publishing never blocks on a slow consumer: when a queue is
//! full, the oldest lossy frame (typing, presence, stats) is evicted to make
//! room, and frames that must not be lost are enqueued regardless.

pub mod outbound;
pub mod topic;

pub use {
    outbound::{OutboundFrame, OutboundQueue},
    topic::Topic,
};

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use {
    dashmap::DashMap,
    livedesk_protocol::{Envelope, is_lossy_event},
    tracing::{debug, warn},
};

struct ConnEntry {
    queue: Arc<OutboundQueue>,
    topics: HashSet<String>,
}

/// Process-wide pub/sub hub. Subscription tables are sharded by topic via
/// `DashMap`; publish never takes a global lock.
#[derive(Default)]
pub struct Broker {
    topics: DashMap<String, HashMap<String, Arc<OutboundQueue>>>,
    conns: DashMap<String, ConnEntry>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back the queue its write task drains.
    pub fn register_connection(&self, conn_id: &str) -> Arc<OutboundQueue> {
        let queue = Arc::new(OutboundQueue::new(
            livedesk_protocol::OUTBOUND_BUFFER_FRAMES,
        ));
        self.conns.insert(conn_id.to_string(), ConnEntry {
            queue: Arc::clone(&queue),
            topics: HashSet::new(),
        });
        queue
    }

    /// Drop a connection: close its queue and leave every topic. Mandatory on
    /// disconnect.
    pub fn unregister_connection(&self, conn_id: &str) {
        self.unsubscribe_all(conn_id);
        if let Some((_, entry)) = self.conns.remove(conn_id) {
            entry.queue.close();
        }
    }

    /// Idempotent: subscribing twice is a no-op.
    pub fn subscribe(&self, conn_id: &str, topic: &Topic) {
        let Some(mut entry) = self.conns.get_mut(conn_id) else {
            warn!(conn_id, topic = %topic, "subscribe for unknown connection");
            return;
        };
        let queue = Arc::clone(&entry.queue);
        entry.topics.insert(topic.name().to_string());
        drop(entry);

        self.topics
            .entry(topic.name().to_string())
            .or_default()
            .insert(conn_id.to_string(), queue);
    }

    /// Idempotent: unsubscribing a non-subscriber is a no-op.
    pub fn unsubscribe(&self, conn_id: &str, topic: &Topic) {
        if let Some(mut entry) = self.conns.get_mut(conn_id) {
            entry.topics.remove(topic.name());
        }
        if let Some(mut subs) = self.topics.get_mut(topic.name()) {
            subs.remove(conn_id);
        }
    }

    pub fn unsubscribe_all(&self, conn_id: &str) {
        let topics: Vec<String> = match self.conns.get_mut(conn_id) {
            Some(mut entry) => entry.topics.drain().collect(),
            None => return,
        };
        for name in topics {
            if let Some(mut subs) = self.topics.get_mut(&name) {
                subs.remove(conn_id);
            }
        }
    }

    /// Fan an envelope out to every current subscriber of the topic. Frames
    /// are serialized once; lossiness is derived from the event name.
    pub fn publish(&self, topic: &Topic, envelope: &Envelope) {
        let json = match serde_json::to_string(envelope) {
            Ok(j) => j,
            Err(e) => {
                warn!(topic = %topic, error = %e, "failed to serialize event");
                return;
            },
        };
        let lossy = is_lossy_event(&envelope.event);

        // Clone the subscriber handles out of the shard so pushes happen
        // without holding the map guard.
        let queues: Vec<Arc<OutboundQueue>> = match self.topics.get(topic.name()) {
            Some(subs) => subs.values().cloned().collect(),
            None => return,
        };

        debug!(topic = %topic, event = %envelope.event, subscribers = queues.len(), "publish");
        for queue in queues {
            queue.push(OutboundFrame {
                json: json.clone(),
                lossy,
            });
        }
    }

    /// Deliver to a single connection, bypassing topics (errors, restores).
    pub fn send_to(&self, conn_id: &str, envelope: &Envelope) {
        let Some(entry) = self.conns.get(conn_id) else {
            return;
        };
        let json = match serde_json::to_string(envelope) {
            Ok(j) => j,
            Err(e) => {
                warn!(conn_id, error = %e, "failed to serialize frame");
                return;
            },
        };
        entry.queue.push(OutboundFrame {
            json,
            lossy: is_lossy_event(&envelope.event),
        });
    }

    /// Subscribe every live connection of the set to a topic (used when an
    /// agent with several windows takes over a session).
    pub fn subscribe_many(&self, conn_ids: &[String], topic: &Topic) {
        for conn_id in conn_ids {
            self.subscribe(conn_id, topic);
        }
    }

    /// Connection ids currently subscribed to a topic. Lets callers attach an
    /// agent's open windows to a session they just took over.
    pub fn conns_on_topic(&self, topic: &Topic) -> Vec<String> {
        self.topics
            .get(topic.name())
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic.name()).map_or(0, |s| s.len())
    }

    pub fn is_subscribed(&self, conn_id: &str, topic: &Topic) -> bool {
        self.conns
            .get(conn_id)
            .is_some_and(|e| e.topics.contains(topic.name()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, livedesk_protocol::server_events};

    fn message_frame() -> Envelope {
        Envelope::new(
            server_events::CHAT_MESSAGE,
            serde_json::json!({"content": "hi"}),
        )
    }

    fn typing_frame() -> Envelope {
        Envelope::new(
            server_events::CHAT_CUSTOMER_TYPING,
            serde_json::json!({"isTyping": true}),
        )
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let broker = Broker::new();
        let q1 = broker.register_connection("c1");
        let q2 = broker.register_connection("c2");
        let topic = Topic::session("s-1");
        broker.subscribe("c1", &topic);
        broker.subscribe("c2", &topic);

        broker.publish(&topic, &message_frame());
        assert!(q1.pop().await.unwrap().json.contains("chat:message"));
        assert!(q2.pop().await.unwrap().json.contains("chat:message"));
    }

    #[tokio::test]
    async fn publish_skips_non_subscribers() {
        let broker = Broker::new();
        let q1 = broker.register_connection("c1");
        let topic = Topic::session("s-1");
        broker.subscribe("c1", &Topic::session("s-2"));

        broker.publish(&topic, &message_frame());
        assert!(q1.try_pop().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let broker = Broker::new();
        broker.register_connection("c1");
        let topic = Topic::queue();
        broker.subscribe("c1", &topic);
        broker.subscribe("c1", &topic);
        assert_eq!(broker.subscriber_count(&topic), 1);

        broker.unsubscribe("c1", &topic);
        broker.unsubscribe("c1", &topic);
        assert_eq!(broker.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn unregister_leaves_every_topic_and_closes_queue() {
        let broker = Broker::new();
        let queue = broker.register_connection("c1");
        broker.subscribe("c1", &Topic::queue());
        broker.subscribe("c1", &Topic::agent(7));

        broker.unregister_connection("c1");
        assert_eq!(broker.subscriber_count(&Topic::queue()), 0);
        assert_eq!(broker.subscriber_count(&Topic::agent(7)), 0);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_lossy_but_keeps_messages() {
        let broker = Broker::new();
        let queue = broker.register_connection("c1");
        let topic = Topic::session("s-1");
        broker.subscribe("c1", &topic);

        // Fill the buffer with typing noise, then overflow with messages.
        for _ in 0..livedesk_protocol::OUTBOUND_BUFFER_FRAMES {
            broker.publish(&topic, &typing_frame());
        }
        for _ in 0..8 {
            broker.publish(&topic, &message_frame());
        }

        let mut messages = 0;
        while let Some(frame) = queue.try_pop() {
            if frame.json.contains("chat:message") {
                messages += 1;
            }
        }
        assert_eq!(messages, 8, "critical frames must survive overflow");
    }

    #[tokio::test]
    async fn send_to_targets_one_connection() {
        let broker = Broker::new();
        let q1 = broker.register_connection("c1");
        let q2 = broker.register_connection("c2");

        broker.send_to("c1", &message_frame());
        assert!(q1.try_pop().is_some());
        assert!(q2.try_pop().is_none());
    }
}
