//! Long-poll waiter registry.
//!
//! # Purpose
//! A pull client that finds no backlog is suspended as a *waiter* until
//! a publish to one of its topics wakes it or its timeout elapses.
//!
//! # Catch-up correctness
//! The waiter is registered *before* the catch-up read. A message that
//! lands between the read and the wait therefore reaches the waiter's
//! buffer; one that lands before the read is returned by catch-up. When
//! catch-up produces data the waiter is dropped along with its buffer,
//! so the overlap never yields duplicates within one poll call.
//!
//! # Locking
//! One mutex guards the waiter map and the topic index. Delivery
//! snapshots the relevant senders under the lock and enqueues outside
//! it; a full buffer drops the message for that waiter only (the client
//! recovers via `since` on its next poll).
use relay_core::Message;
use relay_storage::{DEFAULT_READ_LIMIT, MessageStore, StorageError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Waiter buffers hold at most this many undelivered messages.
pub const WAITER_BUFFER_CAPACITY: usize = 128;
/// Poll timeouts are clamped into this range (a zero timeout skips the
/// wait phase entirely).
pub const MIN_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(60);
/// Safety ceiling: the sweeper reaps waiters older than this.
pub const MAX_WAITER_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("waiter limit reached")]
    AtCapacity,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Default)]
pub struct PollOutcome {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PollStats {
    pub active_waiters: usize,
    pub subscribed_topics: usize,
}

struct WaiterEntry {
    sender: mpsc::Sender<Message>,
    topics: Vec<String>,
    created_at: Instant,
}

#[derive(Default)]
struct WaiterRegistry {
    waiters: HashMap<Uuid, WaiterEntry>,
    by_topic: HashMap<String, HashSet<Uuid>>,
}

impl WaiterRegistry {
    fn remove(&mut self, id: &Uuid) {
        if let Some(entry) = self.waiters.remove(id) {
            for topic in entry.topics {
                if let Some(set) = self.by_topic.get_mut(&topic) {
                    set.remove(id);
                    if set.is_empty() {
                        self.by_topic.remove(&topic);
                    }
                }
            }
        }
    }
}

/// Deregisters the waiter however the poll call ends: delivery, timeout,
/// or the client disconnecting and dropping the request future.
struct WaiterGuard<'a> {
    manager: &'a PollManager,
    id: Uuid,
}

impl std::fmt::Debug for WaiterGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaiterGuard").field("id", &self.id).finish()
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut registry = self.manager.inner.lock().unwrap_or_else(|p| p.into_inner());
        registry.remove(&self.id);
        metrics::gauge!("relay_poll_waiters_active").set(registry.waiters.len() as f64);
    }
}

pub struct PollManager {
    store: Arc<dyn MessageStore>,
    inner: Mutex<WaiterRegistry>,
    max_waiters: usize,
}

impl PollManager {
    pub fn new(store: Arc<dyn MessageStore>, max_waiters: usize) -> Self {
        Self {
            store,
            inner: Mutex::new(WaiterRegistry::default()),
            max_waiters,
        }
    }

    /// Serve one poll request: catch up from the client's cursors, and if
    /// nothing is pending, suspend until delivery or timeout.
    ///
    /// A timed-out poll returns an empty outcome, not an error.
    pub async fn poll(
        &self,
        topics: &[String],
        since: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<PollOutcome, PollError> {
        let (guard, mut rx) = self.register(topics)?;

        // Catch-up phase: the registration above already covers the
        // window between this read and the wait below.
        let mut messages = Vec::new();
        let mut has_more = false;
        for topic in topics {
            let cursor = since.get(topic).map(String::as_str);
            let page = self
                .store
                .read_since(topic, cursor, DEFAULT_READ_LIMIT)
                .await?;
            if page.len() == DEFAULT_READ_LIMIT {
                has_more = true;
            }
            messages.extend(page);
        }
        if !messages.is_empty() {
            drop(guard);
            return Ok(PollOutcome { messages, has_more });
        }

        if timeout.is_zero() {
            drop(guard);
            return Ok(PollOutcome::default());
        }
        let wait = timeout.clamp(MIN_POLL_TIMEOUT, MAX_POLL_TIMEOUT);

        let mut delivered = Vec::new();
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(first)) => {
                delivered.push(first);
                // Grab whatever else is already buffered before replying.
                while let Ok(message) = rx.try_recv() {
                    delivered.push(message);
                }
            }
            // Channel closed (sweeper reaped us) or timeout: reply empty.
            Ok(None) | Err(_) => {}
        }
        drop(guard);
        Ok(PollOutcome {
            messages: delivered,
            has_more: false,
        })
    }

    fn register(&self, topics: &[String]) -> Result<(WaiterGuard<'_>, mpsc::Receiver<Message>), PollError> {
        let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if registry.waiters.len() >= self.max_waiters {
            return Err(PollError::AtCapacity);
        }
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(WAITER_BUFFER_CAPACITY);
        registry.waiters.insert(
            id,
            WaiterEntry {
                sender: tx,
                topics: topics.to_vec(),
                created_at: Instant::now(),
            },
        );
        for topic in topics {
            registry.by_topic.entry(topic.clone()).or_default().insert(id);
        }
        metrics::gauge!("relay_poll_waiters_active").set(registry.waiters.len() as f64);
        Ok((WaiterGuard { manager: self, id }, rx))
    }

    /// Hand a freshly persisted message to every waiter watching its topic.
    pub fn deliver(&self, topic: &str, message: &Message) -> usize {
        let snapshot: Vec<mpsc::Sender<Message>> = {
            let registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            match registry.by_topic.get(topic) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| registry.waiters.get(id).map(|w| w.sender.clone()))
                    .collect(),
                None => return 0,
            }
        };
        let mut delivered = 0;
        for sender in snapshot {
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // The client re-catches-up via `since` on its next poll.
                    metrics::counter!("relay_poll_buffer_dropped_total").increment(1);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        if delivered > 0 {
            metrics::counter!("relay_messages_delivered_total", "topic" => topic.to_string(), "delivery" => "poll")
                .increment(delivered as u64);
        }
        delivered
    }

    /// Reap waiters older than `max_age`, waking their poll calls.
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let stale: Vec<Uuid> = registry
            .waiters
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() > max_age)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            registry.remove(id);
        }
        if !stale.is_empty() {
            metrics::gauge!("relay_poll_waiters_active").set(registry.waiters.len() as f64);
            tracing::info!(reaped = stale.len(), "swept stale poll waiters");
        }
        stale.len()
    }

    /// Periodic safety sweep; waiters should normally end via delivery or
    /// timeout long before the age ceiling.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_older_than(MAX_WAITER_AGE);
            }
        })
    }

    pub fn stats(&self) -> PollStats {
        let registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        PollStats {
            active_waiters: registry.waiters.len(),
            subscribed_topics: registry.by_topic.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_storage::MemoryMessageStore;

    fn message(topic: &str, n: u64) -> Message {
        Message {
            message_id: format!("msg_{n:012x}"),
            topic: topic.to_string(),
            payload: serde_json::json!({ "n": n }),
            timestamp: Utc::now(),
            ttl: None,
            metadata: HashMap::new(),
            stream_id: String::new(),
        }
    }

    fn manager() -> (Arc<PollManager>, Arc<MemoryMessageStore>) {
        let store = Arc::new(MemoryMessageStore::new(10_000));
        let manager = Arc::new(PollManager::new(store.clone(), 100));
        (manager, store)
    }

    #[tokio::test]
    async fn catch_up_returns_immediately() {
        let (manager, store) = manager();
        for n in 1..=3 {
            store.append(&message("events", n)).await.expect("append");
        }
        let all = store.read_since("events", None, 10).await.expect("read");
        let since = HashMap::from([("events".to_string(), all[0].message_id.clone())]);
        let outcome = manager
            .poll(&["events".to_string()], &since, Duration::from_secs(30))
            .await
            .expect("poll");
        assert_eq!(outcome.messages.len(), 2);
        assert!(!outcome.has_more);
        assert_eq!(manager.stats().active_waiters, 0);
    }

    #[tokio::test]
    async fn empty_since_catches_up_from_the_start() {
        let (manager, store) = manager();
        store.append(&message("events", 1)).await.expect("append");
        let outcome = manager
            .poll(&["events".to_string()], &HashMap::new(), Duration::from_secs(30))
            .await
            .expect("poll");
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].payload["n"], 1);
    }

    #[tokio::test]
    async fn waiter_wakes_on_delivery() {
        let (manager, _store) = manager();
        let polling = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .poll(&["events".to_string()], &HashMap::new(), Duration::from_secs(30))
                    .await
                    .expect("poll")
            })
        };
        // Give the poll call time to register and find no backlog.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.deliver("events", &message("events", 7)), 1);
        let outcome = tokio::time::timeout(Duration::from_secs(1), polling)
            .await
            .expect("wakes promptly")
            .expect("join");
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].payload["n"], 7);
    }

    #[tokio::test]
    async fn timed_out_poll_returns_empty_not_error() {
        let (manager, _store) = manager();
        let outcome = manager
            .poll(&["quiet".to_string()], &HashMap::new(), Duration::from_secs(1))
            .await
            .expect("poll");
        assert!(outcome.messages.is_empty());
        assert_eq!(manager.stats().active_waiters, 0);
    }

    #[tokio::test]
    async fn zero_timeout_skips_the_wait_phase() {
        let (manager, store) = manager();
        store.append(&message("events", 1)).await.expect("append");
        let started = Instant::now();
        let outcome = manager
            .poll(&["events".to_string()], &HashMap::new(), Duration::ZERO)
            .await
            .expect("poll");
        assert_eq!(outcome.messages.len(), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancelled_poll_unregisters_its_waiter() {
        let (manager, _store) = manager();
        let polling = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _ = manager
                    .poll(&["events".to_string()], &HashMap::new(), Duration::from_secs(60))
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.stats().active_waiters, 1);
        polling.abort();
        let _ = polling.await;
        assert_eq!(manager.stats().active_waiters, 0);
    }

    #[tokio::test]
    async fn overflowing_a_waiter_buffer_drops_only_the_excess() {
        let (manager, _store) = manager();
        let (_guard, mut rx) = manager.register(&["busy".to_string()]).expect("register");
        let mut accepted = 0;
        for n in 0..(WAITER_BUFFER_CAPACITY + 10) {
            accepted += manager.deliver("busy", &message("busy", n as u64));
        }
        assert_eq!(accepted, WAITER_BUFFER_CAPACITY);
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, WAITER_BUFFER_CAPACITY);
    }

    #[tokio::test]
    async fn sweeper_wakes_ancient_waiters() {
        let (manager, _store) = manager();
        let polling = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .poll(&["events".to_string()], &HashMap::new(), Duration::from_secs(60))
                    .await
                    .expect("poll")
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.sweep_older_than(Duration::ZERO), 1);
        let outcome = tokio::time::timeout(Duration::from_secs(1), polling)
            .await
            .expect("woken by sweep")
            .expect("join");
        assert!(outcome.messages.is_empty());
    }

    #[tokio::test]
    async fn waiter_cap_is_enforced() {
        let store = Arc::new(MemoryMessageStore::new(100));
        let manager = PollManager::new(store, 1);
        let first = manager.register(&["a".to_string()]).expect("register");
        let err = manager.register(&["b".to_string()]).expect_err("at capacity");
        assert!(matches!(err, PollError::AtCapacity));
        drop(first);
        manager.register(&["c".to_string()]).expect("slot released");
    }
}
