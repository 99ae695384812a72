//! Live push-subscriber registry and broadcast fan-out.
//!
//! # Purpose
//! Tracks which socket sessions are subscribed to which topics and
//! duplicates each published message into every subscriber's outbound
//! frame channel.
//!
//! # Locking
//! One mutex guards both index maps. `broadcast` copies the subscriber
//! list under the lock, releases it, and only then attempts delivery, so
//! fan-out never serializes behind a slow client and a send can never
//! re-enter the registry while it is held.
//!
//! # Slow consumers
//! Each connection owns a bounded frame channel drained by its socket
//! writer task. `try_send` on a full or closed channel marks the
//! connection dead; dead connections are pruned from every topic after
//! the snapshot pass.
use relay_core::Message;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

pub type ConnectionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection limit reached")]
    AtCapacity,
}

/// Handle returned to the socket adapter at registration time.
///
/// Dropping the receiver (socket closed) makes subsequent broadcasts
/// observe the connection as dead and prune it.
#[derive(Debug)]
pub struct PushConnection {
    pub id: ConnectionId,
    pub frames: mpsc::Receiver<Arc<Message>>,
}

#[derive(Default)]
struct Registry {
    senders: HashMap<ConnectionId, mpsc::Sender<Arc<Message>>>,
    by_topic: HashMap<String, Vec<ConnectionId>>,
    topics_by_connection: HashMap<ConnectionId, HashSet<String>>,
}

impl Registry {
    fn remove_connection(&mut self, id: ConnectionId) {
        self.senders.remove(&id);
        if let Some(topics) = self.topics_by_connection.remove(&id) {
            for topic in topics {
                if let Some(subscribers) = self.by_topic.get_mut(&topic) {
                    subscribers.retain(|conn| *conn != id);
                    if subscribers.is_empty() {
                        self.by_topic.remove(&topic);
                    }
                }
            }
        }
    }
}

pub struct ConnectionManager {
    inner: Mutex<Registry>,
    next_id: AtomicU64,
    max_connections: usize,
    channel_capacity: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize, channel_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            max_connections,
            channel_capacity,
        }
    }

    /// Admit a new socket session, handing back its frame channel.
    pub fn connect(&self) -> Result<PushConnection, ConnectionError> {
        let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if registry.senders.len() >= self.max_connections {
            return Err(ConnectionError::AtCapacity);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        registry.senders.insert(id, tx);
        registry.topics_by_connection.insert(id, HashSet::new());
        metrics::gauge!("relay_ws_connections_active").set(registry.senders.len() as f64);
        metrics::counter!("relay_ws_connections_total").increment(1);
        Ok(PushConnection { id, frames: rx })
    }

    /// Subscribe a connection to each topic, once per topic at most.
    pub fn subscribe(&self, id: ConnectionId, topics: &[String]) {
        let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if !registry.senders.contains_key(&id) {
            return;
        }
        for topic in topics {
            let newly_added = registry
                .topics_by_connection
                .get_mut(&id)
                .is_some_and(|set| set.insert(topic.clone()));
            if newly_added {
                registry.by_topic.entry(topic.clone()).or_default().push(id);
            }
        }
    }

    /// Unsubscribe a connection from the named topics.
    pub fn unsubscribe(&self, id: ConnectionId, topics: &[String]) {
        let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for topic in topics {
            if let Some(set) = registry.topics_by_connection.get_mut(&id) {
                set.remove(topic);
            }
            if let Some(subscribers) = registry.by_topic.get_mut(topic) {
                subscribers.retain(|conn| *conn != id);
                if subscribers.is_empty() {
                    registry.by_topic.remove(topic);
                }
            }
        }
    }

    /// Remove a connection from every topic and release its slot.
    pub fn disconnect(&self, id: ConnectionId) {
        let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        registry.remove_connection(id);
        metrics::gauge!("relay_ws_connections_active").set(registry.senders.len() as f64);
        metrics::counter!("relay_ws_disconnections_total").increment(1);
    }

    /// Fan a message out to every live subscriber of the topic.
    ///
    /// Returns the number of successful deliveries. Zero subscribers is a
    /// no-op, not an error.
    pub fn broadcast(&self, topic: &str, message: Arc<Message>) -> usize {
        // Snapshot under the lock, deliver outside it.
        let snapshot: Vec<(ConnectionId, mpsc::Sender<Arc<Message>>)> = {
            let registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            match registry.by_topic.get(topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter_map(|id| registry.senders.get(id).map(|tx| (*id, tx.clone())))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sender) in snapshot {
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                // A full channel means the writer task cannot keep up;
                // the connection is treated as dead, like a failed write.
                Err(mpsc::error::TrySendError::Full(_))
                | Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            for id in &dead {
                registry.remove_connection(*id);
            }
            metrics::gauge!("relay_ws_connections_active").set(registry.senders.len() as f64);
            metrics::counter!("relay_ws_dead_connections_total").increment(dead.len() as u64);
            tracing::debug!(topic, pruned = dead.len(), "pruned dead push connections");
        }
        if delivered > 0 {
            metrics::counter!("relay_messages_delivered_total", "topic" => topic.to_string(), "delivery" => "push")
                .increment(delivered as u64);
        }
        delivered
    }

    pub fn at_capacity(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .senders
            .len()
            >= self.max_connections
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .senders
            .len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .by_topic
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn message(topic: &str, n: u64) -> Arc<Message> {
        Arc::new(Message {
            message_id: format!("msg_{n:012x}"),
            topic: topic.to_string(),
            payload: serde_json::json!({ "n": n }),
            timestamp: Utc::now(),
            ttl: None,
            metadata: StdHashMap::new(),
            stream_id: format!("{n}-0"),
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_in_order() {
        let manager = ConnectionManager::new(100, 64);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let conn = manager.connect().expect("connect");
            manager.subscribe(conn.id, &["bench".to_string()]);
            receivers.push(conn.frames);
        }
        for n in 0..5 {
            assert_eq!(manager.broadcast("bench", message("bench", n)), 3);
        }
        for rx in &mut receivers {
            for n in 0..5 {
                let received = rx.recv().await.expect("frame");
                assert_eq!(received.payload["n"], n);
            }
        }
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_noop() {
        let manager = ConnectionManager::new(10, 8);
        assert_eq!(manager.broadcast("empty", message("empty", 1)), 0);
    }

    #[tokio::test]
    async fn duplicate_subscribe_registers_once() {
        let manager = ConnectionManager::new(10, 8);
        let conn = manager.connect().expect("connect");
        manager.subscribe(conn.id, &["notes".to_string()]);
        manager.subscribe(conn.id, &["notes".to_string()]);
        assert_eq!(manager.subscriber_count("notes"), 1);
        assert_eq!(manager.broadcast("notes", message("notes", 1)), 1);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_broadcast() {
        let manager = ConnectionManager::new(10, 8);
        let live = manager.connect().expect("connect");
        manager.subscribe(live.id, &["notes".to_string()]);
        {
            let gone = manager.connect().expect("connect");
            manager.subscribe(gone.id, &["notes".to_string()]);
            // Receiver dropped here: the socket went away without unsubscribing.
        }
        assert_eq!(manager.subscriber_count("notes"), 2);
        assert_eq!(manager.broadcast("notes", message("notes", 1)), 1);
        assert_eq!(manager.subscriber_count("notes"), 1);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn full_channel_counts_as_dead() {
        let manager = ConnectionManager::new(10, 1);
        let mut conn = manager.connect().expect("connect");
        manager.subscribe(conn.id, &["busy".to_string()]);
        assert_eq!(manager.broadcast("busy", message("busy", 1)), 1);
        // Second broadcast overflows the capacity-1 channel.
        assert_eq!(manager.broadcast("busy", message("busy", 2)), 0);
        assert_eq!(manager.connection_count(), 0);
        // The first frame is still drainable by the writer task.
        assert_eq!(conn.frames.recv().await.expect("frame").payload["n"], 1);
    }

    #[tokio::test]
    async fn unsubscribe_and_disconnect_clear_registrations() {
        let manager = ConnectionManager::new(10, 8);
        let conn = manager.connect().expect("connect");
        let topics = vec!["a".to_string(), "b".to_string()];
        manager.subscribe(conn.id, &topics);
        manager.unsubscribe(conn.id, &["a".to_string()]);
        assert_eq!(manager.subscriber_count("a"), 0);
        assert_eq!(manager.subscriber_count("b"), 1);
        manager.disconnect(conn.id);
        assert_eq!(manager.subscriber_count("b"), 0);
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn connection_cap_is_enforced() {
        let manager = ConnectionManager::new(1, 8);
        let _held = manager.connect().expect("connect");
        let err = manager.connect().expect_err("at capacity");
        assert_eq!(err, ConnectionError::AtCapacity);
    }
}
