//! Per-connection outbound buffer.
//!
//! A plain channel cannot express the overflow policy the broker needs
//! (evict the oldest lossy frame, never evict a message), so the queue is a
//! mutex-guarded deque with a `Notify` for the draining write task. Pushes
//! never await; the publish path stays non-blocking per subscriber.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub json: String,
    /// Lossy frames (typing, presence, stats) may be evicted under pressure.
    pub lossy: bool,
}

pub struct OutboundQueue {
    frames: Mutex<VecDeque<OutboundFrame>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame. Returns false when the connection is closed.
    ///
    /// At capacity, the oldest lossy frame is evicted first. When the buffer
    /// is all non-droppable frames it grows past capacity; messages are
    /// never discarded; the connection supervisor decides when a consumer is
    /// too far gone.
    pub fn push(&self, frame: OutboundFrame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut frames = match self.frames.lock() {
                Ok(f) => f,
                Err(_) => return false,
            };
            if frames.len() >= self.capacity {
                if frame.lossy {
                    // The newcomer is the least valuable frame; drop it.
                    return true;
                }
                if let Some(idx) = frames.iter().position(|f| f.lossy) {
                    frames.remove(idx);
                }
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Await the next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut frames = self.frames.lock().ok()?;
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking pop, for tests and shutdown drains.
    pub fn try_pop(&self) -> Option<OutboundFrame> {
        self.frames.lock().ok()?.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn frame(json: &str, lossy: bool) -> OutboundFrame {
        OutboundFrame {
            json: json.into(),
            lossy,
        }
    }

    #[tokio::test]
    async fn frames_come_out_in_push_order() {
        let q = OutboundQueue::new(8);
        q.push(frame("a", false));
        q.push(frame("b", true));
        q.push(frame("c", false));
        assert_eq!(q.pop().await.unwrap().json, "a");
        assert_eq!(q.pop().await.unwrap().json, "b");
        assert_eq!(q.pop().await.unwrap().json, "c");
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_lossy_first() {
        let q = OutboundQueue::new(3);
        q.push(frame("typing-1", true));
        q.push(frame("msg-1", false));
        q.push(frame("typing-2", true));
        // Full. A critical frame evicts typing-1.
        q.push(frame("msg-2", false));

        let order: Vec<String> = std::iter::from_fn(|| q.try_pop().map(|f| f.json)).collect();
        assert_eq!(order, vec!["msg-1", "typing-2", "msg-2"]);
    }

    #[tokio::test]
    async fn overflow_drops_incoming_lossy() {
        let q = OutboundQueue::new(2);
        q.push(frame("msg-1", false));
        q.push(frame("msg-2", false));
        assert!(q.push(frame("typing", true)));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn critical_frames_grow_past_capacity() {
        let q = OutboundQueue::new(2);
        q.push(frame("msg-1", false));
        q.push(frame("msg-2", false));
        q.push(frame("msg-3", false));
        assert_eq!(q.len(), 3);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(OutboundQueue::new(4));
        let reader = std::sync::Arc::clone(&q);
        let handle = tokio::spawn(async move { reader.pop().await });
        tokio::task::yield_now().await;
        q.push(frame("late", false));
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.json, "late");
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = OutboundQueue::new(4);
        q.push(frame("last", false));
        q.close();
        assert!(!q.push(frame("after-close", false)));
        assert_eq!(q.pop().await.unwrap().json, "last");
        assert!(q.pop().await.is_none());
    }
}
