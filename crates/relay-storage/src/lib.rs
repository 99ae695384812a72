//! Pluggable storage for Pulsar Relay.
//!
//! # Purpose
//! Two capabilities live here, each with an in-memory and a Valkey-backed
//! implementation that share identical semantics:
//! - [`MessageStore`]: per-topic append-only message streams with
//!   cursor-based reads and trimming.
//! - [`TopicStore`]: the topic registry consulted by authorization.
//!
//! The backend choice is configuration-time; implementations never mix
//! state. The Valkey backend layers retries with jittered backoff over
//! every command before surfacing an error.
use async_trait::async_trait;
use relay_core::{Message, Topic};
use thiserror::Error;

pub mod memory;
pub mod valkey;

pub use memory::{MemoryMessageStore, MemoryTopicStore};
pub use valkey::{ValkeyMessageStore, ValkeyTopicStore, connect};

/// Default page size for cursor reads.
pub const DEFAULT_READ_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// How to discard old entries from a topic stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrimPolicy {
    /// Retain roughly the most recent `N` messages.
    MaxLen(u64),
    /// Drop everything ordered before the given stream id.
    MinStreamId(String),
}

/// Per-topic append-only message streams.
///
/// `append` assigns and returns the backend's ordering token
/// (`stream_id`); `read_since` returns messages strictly after the given
/// cursor in insertion order and never blocks.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, returning the assigned `stream_id`.
    async fn append(&self, message: &Message) -> StorageResult<String>;

    /// Read up to `limit` messages strictly after `since` (or from the
    /// oldest retained message when `since` is `None`).
    async fn read_since(
        &self,
        topic: &str,
        since: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Message>>;

    /// Number of currently retained messages for the topic.
    async fn length(&self, topic: &str) -> StorageResult<u64>;

    /// Apply a trim policy; returns the number of messages removed.
    /// Trim failures are logged by implementations and never fatal.
    async fn trim(&self, topic: &str, policy: TrimPolicy) -> StorageResult<u64>;

    async fn health_check(&self) -> StorageResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Topic registry: ownership, visibility, and grants.
#[async_trait]
pub trait TopicStore: Send + Sync {
    /// Create a topic record; fails with `Conflict` when the name is taken.
    async fn create(&self, topic: Topic) -> StorageResult<Topic>;

    async fn get(&self, name: &str) -> StorageResult<Option<Topic>>;

    /// Topics the user owns or has been granted access to.
    async fn list_for_user(&self, user_id: &str) -> StorageResult<Vec<Topic>>;

    async fn update(
        &self,
        name: &str,
        is_public: Option<bool>,
        description: Option<String>,
    ) -> StorageResult<Topic>;

    async fn delete(&self, name: &str) -> StorageResult<()>;

    /// Fails with `Conflict` when the user already holds a grant.
    async fn grant(&self, name: &str, user_id: &str) -> StorageResult<()>;

    /// Fails with `NotFound` when no such grant exists.
    async fn revoke(&self, name: &str, user_id: &str) -> StorageResult<()>;

    async fn exists(&self, name: &str) -> StorageResult<bool>;
}
