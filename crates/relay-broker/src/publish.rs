//! Publish pipeline.
//!
//! # Purpose
//! The single write path: validate the request, authorize the producer,
//! materialise the message, persist it, and only then fan it out to the
//! push and poll delivery paths. A storage failure aborts before any
//! fan-out, so subscribers never observe unpersisted messages.
use crate::authz::{Action, AuthzOracle, Decision};
use crate::connections::ConnectionManager;
use crate::polling::PollManager;
use chrono::Utc;
use relay_core::{AuthUser, Message, PublishReceipt, message};
use relay_storage::{MessageStore, StorageError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("payload is {actual} bytes, limit is {limit}")]
    PayloadTooLarge { actual: usize, limit: usize },
    #[error("missing required scope")]
    NoScope,
    #[error("access denied to topic '{0}'")]
    NoAccess(String),
    #[error("topic '{0}' not found")]
    TopicNotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: serde_json::Value,
    pub ttl: Option<u64>,
    pub metadata: Option<HashMap<String, String>>,
}

/// Per-entry outcome of a bulk publish.
#[derive(Debug, Serialize)]
pub struct BulkEntryOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub topic: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkOutcome {
    pub results: Vec<BulkEntryOutcome>,
    pub summary: BulkSummary,
}

#[derive(Debug, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
}

pub struct Publisher {
    store: Arc<dyn MessageStore>,
    authz: Arc<AuthzOracle>,
    connections: Arc<ConnectionManager>,
    polls: Arc<PollManager>,
    max_payload_bytes: usize,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn MessageStore>,
        authz: Arc<AuthzOracle>,
        connections: Arc<ConnectionManager>,
        polls: Arc<PollManager>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            store,
            authz,
            connections,
            polls,
            max_payload_bytes,
        }
    }

    pub async fn publish(
        &self,
        user: &AuthUser,
        request: PublishRequest,
    ) -> Result<PublishReceipt, PublishError> {
        self.validate(&request)?;
        self.check_write_access(user, &request.topic).await?;
        let receipt = self.persist_and_fan_out(request).await?;
        Ok(receipt)
    }

    /// Publish a batch with independent per-entry outcomes.
    ///
    /// Access to every distinct topic is checked up front; any denial
    /// fails the whole batch before anything is persisted. Storage
    /// outcomes after that point are per-entry (no transaction spans the
    /// batch).
    pub async fn publish_bulk(
        &self,
        user: &AuthUser,
        requests: Vec<PublishRequest>,
    ) -> Result<BulkOutcome, PublishError> {
        if requests.is_empty() {
            return Err(PublishError::Invalid("messages must be non-empty".into()));
        }
        let topics: HashSet<&str> = requests.iter().map(|r| r.topic.as_str()).collect();
        for topic in topics {
            message::validate_topic_name(topic)
                .map_err(|err| PublishError::Invalid(err.to_string()))?;
            self.check_write_access(user, topic).await?;
        }

        let total = requests.len();
        let mut results = Vec::with_capacity(total);
        let mut accepted = 0;
        for request in requests {
            let topic = request.topic.clone();
            let outcome = match self.validate(&request) {
                Err(err) => Err(err),
                Ok(()) => self.persist_and_fan_out(request).await,
            };
            match outcome {
                Ok(receipt) => {
                    accepted += 1;
                    results.push(BulkEntryOutcome {
                        message_id: Some(receipt.message_id),
                        topic,
                        status: "accepted",
                        error: None,
                    });
                }
                Err(err) => results.push(BulkEntryOutcome {
                    message_id: None,
                    topic,
                    status: "rejected",
                    error: Some(err.to_string()),
                }),
            }
        }
        Ok(BulkOutcome {
            results,
            summary: BulkSummary {
                total,
                accepted,
                rejected: total - accepted,
            },
        })
    }

    fn validate(&self, request: &PublishRequest) -> Result<(), PublishError> {
        message::validate_topic_name(&request.topic)
            .map_err(|err| PublishError::Invalid(err.to_string()))?;
        if let Some(metadata) = &request.metadata {
            message::validate_metadata(metadata)
                .map_err(|err| PublishError::Invalid(err.to_string()))?;
        }
        if let Some(0) = request.ttl {
            return Err(PublishError::Invalid("ttl must be positive".into()));
        }
        let size = serde_json::to_vec(&request.payload)
            .map_err(|err| PublishError::Invalid(err.to_string()))?
            .len();
        if size > self.max_payload_bytes {
            return Err(PublishError::PayloadTooLarge {
                actual: size,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    async fn check_write_access(&self, user: &AuthUser, topic: &str) -> Result<(), PublishError> {
        match self.authz.authorize(user, topic, Action::Write).await? {
            Decision::Allow => Ok(()),
            Decision::DenyNoScope => Err(PublishError::NoScope),
            Decision::DenyNoAccess => Err(PublishError::NoAccess(topic.to_string())),
            Decision::TopicNotFound => Err(PublishError::TopicNotFound(topic.to_string())),
        }
    }

    async fn persist_and_fan_out(
        &self,
        request: PublishRequest,
    ) -> Result<PublishReceipt, PublishError> {
        let mut message = Message {
            message_id: Message::generate_id(),
            topic: request.topic,
            payload: request.payload,
            timestamp: Utc::now(),
            ttl: request.ttl,
            metadata: request.metadata.unwrap_or_default(),
            stream_id: String::new(),
        };

        metrics::counter!("relay_messages_received_total", "topic" => message.topic.clone())
            .increment(1);
        let started = Instant::now();
        message.stream_id = self.store.append(&message).await?;
        metrics::histogram!("relay_publish_latency_seconds", "topic" => message.topic.clone())
            .record(started.elapsed().as_secs_f64());

        let receipt = PublishReceipt {
            message_id: message.message_id.clone(),
            topic: message.topic.clone(),
            timestamp: message.timestamp,
        };

        // Delivery failures are subscriber-local; the publish already
        // succeeded once the append returned.
        let topic = message.topic.clone();
        let shared = Arc::new(message);
        let push = self.connections.broadcast(&topic, shared.clone());
        let poll = self.polls.deliver(&topic, &shared);
        tracing::debug!(%topic, push, poll, message_id = %receipt.message_id, "fanned out");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use relay_core::{Scope, Topic};
    use relay_storage::{MemoryMessageStore, MemoryTopicStore, StorageResult, TopicStore, TrimPolicy};
    use std::collections::BTreeSet;

    /// Storage stub that always reports the backend as unreachable.
    struct DownStore;

    #[async_trait]
    impl MessageStore for DownStore {
        async fn append(&self, _message: &Message) -> StorageResult<String> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn read_since(
            &self,
            _topic: &str,
            _since: Option<&str>,
            _limit: usize,
        ) -> StorageResult<Vec<Message>> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn length(&self, _topic: &str) -> StorageResult<u64> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn trim(&self, _topic: &str, _policy: TrimPolicy) -> StorageResult<u64> {
            Ok(0)
        }
        async fn health_check(&self) -> StorageResult<()> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    async fn seeded_topics() -> Arc<MemoryTopicStore> {
        let topics = Arc::new(MemoryTopicStore::new());
        topics
            .create(Topic {
                topic_id: "t-notes".to_string(),
                name: "notes".to_string(),
                owner_id: "alice".to_string(),
                is_public: false,
                description: None,
                granted_user_ids: BTreeSet::new(),
                created_at: Utc::now(),
            })
            .await
            .expect("seed topic");
        topics
    }

    async fn publisher_with(store: Arc<dyn MessageStore>) -> (Publisher, Arc<ConnectionManager>, Arc<PollManager>) {
        let topics = seeded_topics().await;
        let connections = Arc::new(ConnectionManager::new(100, 64));
        let polls = Arc::new(PollManager::new(store.clone(), 100));
        let publisher = Publisher::new(
            store,
            Arc::new(AuthzOracle::new(topics)),
            connections.clone(),
            polls.clone(),
            1024,
        );
        (publisher, connections, polls)
    }

    fn alice() -> AuthUser {
        AuthUser::new("alice", "alice", vec![Scope::Read, Scope::Write])
    }

    fn request(topic: &str, n: u64) -> PublishRequest {
        PublishRequest {
            topic: topic.to_string(),
            payload: serde_json::json!({ "n": n }),
            ttl: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn publish_persists_and_fans_out() {
        let store = Arc::new(MemoryMessageStore::new(1000));
        let (publisher, connections, _polls) = publisher_with(store.clone()).await;
        let conn = connections.connect().expect("connect");
        connections.subscribe(conn.id, &["notes".to_string()]);
        let mut frames = conn.frames;

        let receipt = publisher.publish(&alice(), request("notes", 1)).await.expect("publish");
        assert!(receipt.message_id.starts_with("msg_"));

        let stored = store.read_since("notes", None, 10).await.expect("read");
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].stream_id.is_empty());

        let pushed = frames.recv().await.expect("frame");
        assert_eq!(pushed.message_id, receipt.message_id);
        assert_eq!(pushed.stream_id, stored[0].stream_id);
    }

    #[tokio::test]
    async fn publish_to_missing_topic_fails_without_creating_it() {
        let store = Arc::new(MemoryMessageStore::new(1000));
        let (publisher, _connections, _polls) = publisher_with(store.clone()).await;
        let err = publisher
            .publish(&alice(), request("ghost", 1))
            .await
            .expect_err("unknown topic");
        assert!(matches!(err, PublishError::TopicNotFound(_)));
        assert_eq!(store.length("ghost").await.expect("length"), 0);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_persistence() {
        let store = Arc::new(MemoryMessageStore::new(1000));
        let (publisher, _connections, _polls) = publisher_with(store.clone()).await;
        let big = PublishRequest {
            topic: "notes".to_string(),
            payload: serde_json::json!({ "blob": "x".repeat(4096) }),
            ttl: None,
            metadata: None,
        };
        let err = publisher.publish(&alice(), big).await.expect_err("too large");
        assert!(matches!(err, PublishError::PayloadTooLarge { .. }));
        assert_eq!(store.length("notes").await.expect("length"), 0);
    }

    #[tokio::test]
    async fn denied_writer_does_not_persist() {
        let store = Arc::new(MemoryMessageStore::new(1000));
        let (publisher, _connections, _polls) = publisher_with(store.clone()).await;
        let bob = AuthUser::new("bob", "bob", vec![Scope::Read, Scope::Write]);
        let err = publisher.publish(&bob, request("notes", 1)).await.expect_err("denied");
        assert!(matches!(err, PublishError::NoAccess(_)));
        assert_eq!(store.length("notes").await.expect("length"), 0);
    }

    #[tokio::test]
    async fn storage_outage_aborts_before_fan_out() {
        let (publisher, connections, _polls) = publisher_with(Arc::new(DownStore)).await;
        let conn = connections.connect().expect("connect");
        connections.subscribe(conn.id, &["notes".to_string()]);
        let mut frames = conn.frames;

        let err = publisher
            .publish(&alice(), request("notes", 1))
            .await
            .expect_err("storage down");
        assert!(matches!(err, PublishError::Storage(StorageError::Unavailable(_))));
        // Nothing was fanned out for the failed publish.
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn bulk_reports_per_entry_outcomes() {
        let store = Arc::new(MemoryMessageStore::new(1000));
        let (publisher, _connections, _polls) = publisher_with(store.clone()).await;
        let requests = vec![
            request("notes", 1),
            PublishRequest {
                topic: "notes".to_string(),
                payload: serde_json::json!({ "blob": "x".repeat(4096) }),
                ttl: None,
                metadata: None,
            },
            request("notes", 3),
        ];
        let outcome = publisher
            .publish_bulk(&alice(), requests)
            .await
            .expect("bulk");
        assert_eq!(outcome.summary.total, 3);
        assert_eq!(outcome.summary.accepted, 2);
        assert_eq!(outcome.summary.rejected, 1);
        assert_eq!(outcome.results[1].status, "rejected");
        assert_eq!(store.length("notes").await.expect("length"), 2);
    }

    #[tokio::test]
    async fn bulk_denies_whole_batch_on_any_inaccessible_topic() {
        let store = Arc::new(MemoryMessageStore::new(1000));
        let (publisher, _connections, _polls) = publisher_with(store.clone()).await;
        let requests = vec![request("notes", 1), request("ghost", 2)];
        let err = publisher
            .publish_bulk(&alice(), requests)
            .await
            .expect_err("batch denied");
        assert!(matches!(err, PublishError::TopicNotFound(_)));
        assert_eq!(store.length("notes").await.expect("length"), 0);
    }
}
