//! Valkey-backed storage using Streams.
//!
//! # Purpose
//! Durable counterpart of the in-memory backends. Messages live in one
//! stream key per topic (`topic:<name>:stream`, XADD/XRANGE/XLEN/XTRIM);
//! the topic registry lives in a hash plus grant/ownership sets.
//!
//! # Durability
//! Inherits the server's persistence policy (expected: append-only log
//! with per-second fsync). The relay itself promises at-least-once to
//! live subscribers plus whatever the server retains for replay.
//!
//! # Failure handling
//! Every command runs through a retry wrapper: up to three attempts with
//! jittered exponential backoff (50 ms doubling, capped at 1 s) before
//! surfacing `StorageError::Unavailable`.
use crate::{MessageStore, StorageError, StorageResult, TopicStore, TrimPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use redis::aio::ConnectionManager;
use relay_core::{Message, Topic};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Open a managed connection to a Valkey server.
///
/// The returned handle is cheap to clone; reconnection after transient
/// failures is handled internally by the manager.
pub async fn connect(host: &str, port: u16, use_tls: bool) -> StorageResult<ConnectionManager> {
    let scheme = if use_tls { "rediss" } else { "redis" };
    let url = format!("{scheme}://{host}:{port}/");
    let client = redis::Client::open(url)
        .map_err(|err| StorageError::Unavailable(format!("invalid valkey address: {err}")))?;
    ConnectionManager::new(client)
        .await
        .map_err(|err| StorageError::Unavailable(format!("valkey connect failed: {err}")))
}

fn stream_key(topic: &str) -> String {
    format!("topic:{topic}:stream")
}

fn topic_key(name: &str) -> String {
    format!("topic:{name}")
}

fn grants_key(name: &str) -> String {
    format!("topic:{name}:grants")
}

fn owned_key(user_id: &str) -> String {
    format!("user:{user_id}:owned")
}

fn accessible_key(user_id: &str) -> String {
    format!("user:{user_id}:topics")
}

/// Run a command with retries, counting outcomes.
async fn with_retry<T, F, Fut>(
    conn: &ConnectionManager,
    operation: &'static str,
    mut call: F,
) -> StorageResult<T>
where
    F: FnMut(ConnectionManager) -> Fut,
    Fut: Future<Output = redis::RedisResult<T>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut last_error = String::new();
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let jitter = Duration::from_millis(rand::rng().random_range(0..25));
            tokio::time::sleep(delay + jitter).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        match call(conn.clone()).await {
            Ok(value) => {
                metrics::counter!("relay_storage_operations_total", "operation" => operation, "status" => "ok")
                    .increment(1);
                return Ok(value);
            }
            Err(err) => {
                tracing::warn!(operation, attempt, error = %err, "valkey command failed");
                last_error = err.to_string();
            }
        }
    }
    metrics::counter!("relay_storage_operations_total", "operation" => operation, "status" => "error")
        .increment(1);
    Err(StorageError::Unavailable(format!(
        "{operation} failed after {MAX_ATTEMPTS} attempts: {last_error}"
    )))
}

/// Message streams persisted as Valkey Streams.
pub struct ValkeyMessageStore {
    conn: ConnectionManager,
    max_per_topic: u64,
}

impl ValkeyMessageStore {
    pub fn new(conn: ConnectionManager, max_per_topic: u64) -> Self {
        Self { conn, max_per_topic }
    }

    fn entry_to_message(topic: &str, entry_id: String, fields: HashMap<String, String>) -> Option<Message> {
        let payload = match serde_json::from_str(fields.get("payload")?) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(topic, %entry_id, error = %err, "skipping undecodable payload");
                return None;
            }
        };
        let timestamp = fields
            .get("timestamp")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))?;
        let metadata = fields
            .get("metadata")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        Some(Message {
            message_id: fields.get("message_id").cloned().unwrap_or_default(),
            topic: topic.to_string(),
            payload,
            timestamp,
            ttl: fields.get("ttl").and_then(|raw| raw.parse().ok()),
            metadata,
            stream_id: entry_id,
        })
    }
}

#[async_trait]
impl MessageStore for ValkeyMessageStore {
    async fn append(&self, message: &Message) -> StorageResult<String> {
        let key = stream_key(&message.topic);
        let mut fields = vec![
            ("message_id".to_string(), message.message_id.clone()),
            (
                "payload".to_string(),
                serde_json::to_string(&message.payload)
                    .map_err(|err| StorageError::Unavailable(err.to_string()))?,
            ),
            ("timestamp".to_string(), message.timestamp.to_rfc3339()),
        ];
        if !message.metadata.is_empty() {
            fields.push((
                "metadata".to_string(),
                serde_json::to_string(&message.metadata)
                    .map_err(|err| StorageError::Unavailable(err.to_string()))?,
            ));
        }
        if let Some(ttl) = message.ttl {
            fields.push(("ttl".to_string(), ttl.to_string()));
        }

        let max_len = self.max_per_topic;
        let stream_id = with_retry(&self.conn, "xadd", move |mut conn| {
            let key = key.clone();
            let fields = fields.clone();
            async move {
                let mut cmd = redis::cmd("XADD");
                cmd.arg(&key);
                // Approximate trimming on the write path keeps the stream
                // near its cap without a separate maintenance pass.
                cmd.arg("MAXLEN").arg("~").arg(max_len);
                cmd.arg("*");
                for (field, value) in &fields {
                    cmd.arg(field).arg(value);
                }
                cmd.query_async::<String>(&mut conn).await
            }
        })
        .await?;
        Ok(stream_id)
    }

    async fn read_since(
        &self,
        topic: &str,
        since: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        let key = stream_key(topic);
        // "(" prefixes an exclusive range start; "-" reads from the oldest.
        let start = match since {
            Some(cursor) => format!("({cursor}"),
            None => "-".to_string(),
        };
        let entries: Vec<(String, HashMap<String, String>)> =
            with_retry(&self.conn, "xrange", move |mut conn| {
                let key = key.clone();
                let start = start.clone();
                async move {
                    redis::cmd("XRANGE")
                        .arg(&key)
                        .arg(&start)
                        .arg("+")
                        .arg("COUNT")
                        .arg(limit)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|(entry_id, fields)| Self::entry_to_message(topic, entry_id, fields))
            .collect())
    }

    async fn length(&self, topic: &str) -> StorageResult<u64> {
        let key = stream_key(topic);
        with_retry(&self.conn, "xlen", move |mut conn| {
            let key = key.clone();
            async move { redis::cmd("XLEN").arg(&key).query_async(&mut conn).await }
        })
        .await
    }

    async fn trim(&self, topic: &str, policy: TrimPolicy) -> StorageResult<u64> {
        let key = stream_key(topic);
        let result = with_retry(&self.conn, "xtrim", move |mut conn| {
            let key = key.clone();
            let policy = policy.clone();
            async move {
                let mut cmd = redis::cmd("XTRIM");
                cmd.arg(&key);
                match &policy {
                    TrimPolicy::MaxLen(keep) => {
                        cmd.arg("MAXLEN").arg("~").arg(*keep);
                    }
                    TrimPolicy::MinStreamId(min_id) => {
                        cmd.arg("MINID").arg("~").arg(min_id);
                    }
                }
                cmd.query_async(&mut conn).await
            }
        })
        .await;
        // Trimming is maintenance; a failure is logged, not propagated.
        match result {
            Ok(removed) => Ok(removed),
            Err(err) => {
                tracing::warn!(topic, error = %err, "stream trim failed");
                Ok(0)
            }
        }
    }

    async fn health_check(&self) -> StorageResult<()> {
        let pong: String = with_retry(&self.conn, "ping", move |mut conn| async move {
            redis::cmd("PING").query_async(&mut conn).await
        })
        .await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!("unexpected PING reply: {pong}")))
        }
    }

    fn backend_name(&self) -> &'static str {
        "valkey"
    }
}

/// Topic registry persisted in Valkey hashes and sets.
pub struct ValkeyTopicStore {
    conn: ConnectionManager,
}

impl ValkeyTopicStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn load(&self, name: &str) -> StorageResult<Option<Topic>> {
        let key = topic_key(name);
        let fields: HashMap<String, String> = with_retry(&self.conn, "hgetall", move |mut conn| {
            let key = key.clone();
            async move { redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await }
        })
        .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let grants = grants_key(name);
        let granted: Vec<String> = with_retry(&self.conn, "smembers", move |mut conn| {
            let grants = grants.clone();
            async move { redis::cmd("SMEMBERS").arg(&grants).query_async(&mut conn).await }
        })
        .await?;
        let created_at = fields
            .get("created_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Some(Topic {
            topic_id: fields.get("topic_id").cloned().unwrap_or_default(),
            name: name.to_string(),
            owner_id: fields.get("owner_id").cloned().unwrap_or_default(),
            is_public: fields.get("is_public").map(|v| v == "true").unwrap_or(false),
            description: fields.get("description").filter(|v| !v.is_empty()).cloned(),
            granted_user_ids: granted.into_iter().collect::<BTreeSet<_>>(),
            created_at,
        }))
    }
}

#[async_trait]
impl TopicStore for ValkeyTopicStore {
    async fn create(&self, topic: Topic) -> StorageResult<Topic> {
        let key = topic_key(&topic.name);
        let topic_id = topic.topic_id.clone();
        // HSETNX on a sentinel field makes creation atomic: exactly one
        // concurrent creator observes 1 here.
        let created: i64 = with_retry(&self.conn, "hsetnx", move |mut conn| {
            let key = key.clone();
            let topic_id = topic_id.clone();
            async move {
                redis::cmd("HSETNX")
                    .arg(&key)
                    .arg("topic_id")
                    .arg(&topic_id)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await?;
        if created == 0 {
            return Err(StorageError::Conflict(format!(
                "topic '{}' already exists",
                topic.name
            )));
        }

        let key = topic_key(&topic.name);
        let record = topic.clone();
        with_retry::<(), _, _>(&self.conn, "hset", move |mut conn| {
            let key = key.clone();
            let record = record.clone();
            async move {
                redis::cmd("HSET")
                    .arg(&key)
                    .arg("owner_id")
                    .arg(&record.owner_id)
                    .arg("is_public")
                    .arg(if record.is_public { "true" } else { "false" })
                    .arg("description")
                    .arg(record.description.as_deref().unwrap_or(""))
                    .arg("created_at")
                    .arg(record.created_at.to_rfc3339())
                    .query_async(&mut conn)
                    .await
            }
        })
        .await?;

        let owned = owned_key(&topic.owner_id);
        let accessible = accessible_key(&topic.owner_id);
        let name = topic.name.clone();
        with_retry::<(), _, _>(&self.conn, "sadd", move |mut conn| {
            let owned = owned.clone();
            let accessible = accessible.clone();
            let name = name.clone();
            async move {
                redis::cmd("SADD").arg(&owned).arg(&name).query_async::<()>(&mut conn).await?;
                redis::cmd("SADD").arg(&accessible).arg(&name).query_async(&mut conn).await
            }
        })
        .await?;
        Ok(topic)
    }

    async fn get(&self, name: &str) -> StorageResult<Option<Topic>> {
        self.load(name).await
    }

    async fn list_for_user(&self, user_id: &str) -> StorageResult<Vec<Topic>> {
        let accessible = accessible_key(user_id);
        let names: Vec<String> = with_retry(&self.conn, "smembers", move |mut conn| {
            let accessible = accessible.clone();
            async move {
                redis::cmd("SMEMBERS").arg(&accessible).query_async(&mut conn).await
            }
        })
        .await?;
        let mut topics = Vec::with_capacity(names.len());
        for name in names {
            if let Some(topic) = self.load(&name).await? {
                topics.push(topic);
            }
        }
        Ok(topics)
    }

    async fn update(
        &self,
        name: &str,
        is_public: Option<bool>,
        description: Option<String>,
    ) -> StorageResult<Topic> {
        if self.load(name).await?.is_none() {
            return Err(StorageError::NotFound(format!("topic '{name}'")));
        }
        let key = topic_key(name);
        with_retry::<(), _, _>(&self.conn, "hset", move |mut conn| {
            let key = key.clone();
            let description = description.clone();
            async move {
                let mut cmd = redis::cmd("HSET");
                cmd.arg(&key);
                if let Some(public) = is_public {
                    cmd.arg("is_public").arg(if public { "true" } else { "false" });
                }
                if let Some(text) = &description {
                    cmd.arg("description").arg(text);
                }
                cmd.query_async(&mut conn).await
            }
        })
        .await?;
        self.load(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("topic '{name}'")))
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        let Some(topic) = self.load(name).await? else {
            return Err(StorageError::NotFound(format!("topic '{name}'")));
        };
        // Deleting a topic also drops its message stream.
        let keys = vec![topic_key(name), grants_key(name), stream_key(name)];
        with_retry::<(), _, _>(&self.conn, "del", move |mut conn| {
            let keys = keys.clone();
            async move { redis::cmd("DEL").arg(&keys).query_async(&mut conn).await }
        })
        .await?;
        let mut members = vec![topic.owner_id.clone()];
        members.extend(topic.granted_user_ids.iter().cloned());
        let name_owned = name.to_string();
        let owner = topic.owner_id.clone();
        with_retry::<(), _, _>(&self.conn, "srem", move |mut conn| {
            let members = members.clone();
            let name = name_owned.clone();
            let owner = owner.clone();
            async move {
                redis::cmd("SREM")
                    .arg(owned_key(&owner))
                    .arg(&name)
                    .query_async::<()>(&mut conn)
                    .await?;
                for user in &members {
                    redis::cmd("SREM")
                        .arg(accessible_key(user))
                        .arg(&name)
                        .query_async::<()>(&mut conn)
                        .await?;
                }
                Ok(())
            }
        })
        .await
    }

    async fn grant(&self, name: &str, user_id: &str) -> StorageResult<()> {
        if self.load(name).await?.is_none() {
            return Err(StorageError::NotFound(format!("topic '{name}'")));
        }
        let grants = grants_key(name);
        let user = user_id.to_string();
        let added: i64 = with_retry(&self.conn, "sadd", move |mut conn| {
            let grants = grants.clone();
            let user = user.clone();
            async move { redis::cmd("SADD").arg(&grants).arg(&user).query_async(&mut conn).await }
        })
        .await?;
        if added == 0 {
            return Err(StorageError::Conflict(format!(
                "user '{user_id}' already granted on '{name}'"
            )));
        }
        let accessible = accessible_key(user_id);
        let name_owned = name.to_string();
        with_retry::<(), _, _>(&self.conn, "sadd", move |mut conn| {
            let accessible = accessible.clone();
            let name = name_owned.clone();
            async move { redis::cmd("SADD").arg(&accessible).arg(&name).query_async(&mut conn).await }
        })
        .await
    }

    async fn revoke(&self, name: &str, user_id: &str) -> StorageResult<()> {
        let grants = grants_key(name);
        let user = user_id.to_string();
        let removed: i64 = with_retry(&self.conn, "srem", move |mut conn| {
            let grants = grants.clone();
            let user = user.clone();
            async move { redis::cmd("SREM").arg(&grants).arg(&user).query_async(&mut conn).await }
        })
        .await?;
        if removed == 0 {
            return Err(StorageError::NotFound(format!(
                "no grant for '{user_id}' on '{name}'"
            )));
        }
        let accessible = accessible_key(user_id);
        let name_owned = name.to_string();
        with_retry::<(), _, _>(&self.conn, "srem", move |mut conn| {
            let accessible = accessible.clone();
            let name = name_owned.clone();
            async move { redis::cmd("SREM").arg(&accessible).arg(&name).query_async(&mut conn).await }
        })
        .await
    }

    async fn exists(&self, name: &str) -> StorageResult<bool> {
        let key = topic_key(name);
        let found: i64 = with_retry(&self.conn, "exists", move |mut conn| {
            let key = key.clone();
            async move { redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await }
        })
        .await?;
        Ok(found == 1)
    }
}
