//! In-memory storage backends.
//!
//! # Purpose
//! Implements [`MessageStore`] and [`TopicStore`] entirely in process
//! memory. Used for local development and tests, and as the reference
//! semantics the Valkey backend must match.
//!
//! # Durability and consistency
//! - **Not durable**: everything is lost on restart.
//! - Message logs are topic-granular: each topic has its own mutex, so
//!   appends to different topics never contend.
//! - Reads snapshot under the lock and return owned copies.
use crate::{MessageStore, StorageError, StorageResult, TopicStore, TrimPolicy};
use async_trait::async_trait;
use chrono::Utc;
use relay_core::{Message, Topic};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// One topic's retained messages plus its sequence counter.
#[derive(Debug, Default)]
struct TopicLog {
    entries: VecDeque<Message>,
    next_seq: u64,
}

impl TopicLog {
    /// Assign the next stream id as `<unix-ms>-<seq>`.
    ///
    /// The sequence component keeps ids strictly increasing even when
    /// several appends land within the same millisecond.
    fn assign_stream_id(&mut self) -> String {
        let seq = self.next_seq;
        self.next_seq += 1;
        format!("{}-{seq}", Utc::now().timestamp_millis())
    }
}

/// Position of a cursor within a topic log.
fn position_after(entries: &VecDeque<Message>, cursor: &str) -> Option<usize> {
    entries
        .iter()
        .position(|m| m.message_id == cursor || m.stream_id == cursor)
        .map(|idx| idx + 1)
}

/// Parse a `<unix-ms>-<seq>` stream id into its ordering components.
fn parse_stream_id(id: &str) -> Option<(i64, u64)> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

/// In-memory message streams with per-topic locking.
pub struct MemoryMessageStore {
    topics: RwLock<HashMap<String, Arc<Mutex<TopicLog>>>>,
    max_per_topic: usize,
}

impl MemoryMessageStore {
    pub fn new(max_per_topic: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            max_per_topic,
        }
    }

    async fn log_for(&self, topic: &str) -> Arc<Mutex<TopicLog>> {
        if let Some(log) = self.topics.read().await.get(topic) {
            return log.clone();
        }
        let mut topics = self.topics.write().await;
        topics.entry(topic.to_string()).or_default().clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: &Message) -> StorageResult<String> {
        let log = self.log_for(&message.topic).await;
        let mut state = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let stream_id = state.assign_stream_id();
        let mut stored = message.clone();
        stored.stream_id = stream_id.clone();
        state.entries.push_back(stored);
        // Trim synchronously from the head once the topic overflows.
        while state.entries.len() > self.max_per_topic {
            state.entries.pop_front();
        }
        metrics::counter!("relay_storage_operations_total", "operation" => "append", "status" => "ok")
            .increment(1);
        Ok(stream_id)
    }

    async fn read_since(
        &self,
        topic: &str,
        since: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        let Some(log) = self.topics.read().await.get(topic).cloned() else {
            return Ok(Vec::new());
        };
        let state = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = match since {
            None => 0,
            Some(cursor) => match position_after(&state.entries, cursor) {
                Some(idx) => idx,
                // A cursor that no longer matches a retained entry may
                // still order against stream ids (e.g. after trimming).
                None => match parse_stream_id(cursor) {
                    Some(parsed) => state
                        .entries
                        .iter()
                        .position(|m| {
                            parse_stream_id(&m.stream_id).is_some_and(|own| own > parsed)
                        })
                        .unwrap_or(state.entries.len()),
                    None => 0,
                },
            },
        };
        Ok(state.entries.iter().skip(start).take(limit).cloned().collect())
    }

    async fn length(&self, topic: &str) -> StorageResult<u64> {
        let topics = self.topics.read().await;
        Ok(topics
            .get(topic)
            .map(|log| {
                log.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .entries
                    .len() as u64
            })
            .unwrap_or(0))
    }

    async fn trim(&self, topic: &str, policy: TrimPolicy) -> StorageResult<u64> {
        let Some(log) = self.topics.read().await.get(topic).cloned() else {
            return Ok(0);
        };
        let mut state = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = state.entries.len();
        match policy {
            TrimPolicy::MaxLen(keep) => {
                while state.entries.len() as u64 > keep {
                    state.entries.pop_front();
                }
            }
            TrimPolicy::MinStreamId(min_id) => {
                if let Some(min) = parse_stream_id(&min_id) {
                    while let Some(front) = state.entries.front() {
                        match parse_stream_id(&front.stream_id) {
                            Some(own) if own < min => {
                                state.entries.pop_front();
                            }
                            _ => break,
                        }
                    }
                }
            }
        }
        Ok((before - state.entries.len()) as u64)
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// In-memory topic registry.
pub struct MemoryTopicStore {
    topics: RwLock<HashMap<String, Topic>>,
}

impl MemoryTopicStore {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTopicStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicStore for MemoryTopicStore {
    async fn create(&self, topic: Topic) -> StorageResult<Topic> {
        let mut topics = self.topics.write().await;
        if topics.contains_key(&topic.name) {
            return Err(StorageError::Conflict(format!(
                "topic '{}' already exists",
                topic.name
            )));
        }
        topics.insert(topic.name.clone(), topic.clone());
        metrics::gauge!("relay_topics_total").set(topics.len() as f64);
        Ok(topic)
    }

    async fn get(&self, name: &str) -> StorageResult<Option<Topic>> {
        Ok(self.topics.read().await.get(name).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> StorageResult<Vec<Topic>> {
        Ok(self
            .topics
            .read()
            .await
            .values()
            .filter(|t| t.is_owner(user_id) || t.is_granted(user_id))
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        name: &str,
        is_public: Option<bool>,
        description: Option<String>,
    ) -> StorageResult<Topic> {
        let mut topics = self.topics.write().await;
        let topic = topics
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("topic '{name}'")))?;
        if let Some(public) = is_public {
            topic.is_public = public;
        }
        if let Some(text) = description {
            topic.description = Some(text);
        }
        Ok(topic.clone())
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        let mut topics = self.topics.write().await;
        if topics.remove(name).is_none() {
            return Err(StorageError::NotFound(format!("topic '{name}'")));
        }
        metrics::gauge!("relay_topics_total").set(topics.len() as f64);
        Ok(())
    }

    async fn grant(&self, name: &str, user_id: &str) -> StorageResult<()> {
        let mut topics = self.topics.write().await;
        let topic = topics
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("topic '{name}'")))?;
        if !topic.granted_user_ids.insert(user_id.to_string()) {
            return Err(StorageError::Conflict(format!(
                "user '{user_id}' already granted on '{name}'"
            )));
        }
        Ok(())
    }

    async fn revoke(&self, name: &str, user_id: &str) -> StorageResult<()> {
        let mut topics = self.topics.write().await;
        let topic = topics
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("topic '{name}'")))?;
        if !topic.granted_user_ids.remove(user_id) {
            return Err(StorageError::NotFound(format!(
                "no grant for '{user_id}' on '{name}'"
            )));
        }
        Ok(())
    }

    async fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.topics.read().await.contains_key(name))
    }
}
