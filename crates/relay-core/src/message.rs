//! Message model and validation.
//!
//! # Purpose
//! A `Message` is the immutable unit carried end to end: producers create
//! it, the storage backend assigns its ordering token, and both delivery
//! paths hand out shared read-only views of it.
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Topic names are routing keys; keep them short and shell-safe.
pub const TOPIC_NAME_MAX_LEN: usize = 256;
/// Bound on individual metadata keys.
pub const METADATA_KEY_MAX_LEN: usize = 256;
/// Bound on individual metadata values.
pub const METADATA_VALUE_MAX_LEN: usize = 1024;
/// Bound on the number of metadata entries per message.
pub const METADATA_MAX_ENTRIES: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("topic name must be 1-{TOPIC_NAME_MAX_LEN} characters from [A-Za-z0-9_.:-]")]
    InvalidTopicName,
    #[error("metadata entry too large or too many entries")]
    InvalidMetadata,
}

/// An immutable message scoped to exactly one topic.
///
/// `stream_id` is the backend-assigned ordering token; it is empty until
/// the message has been appended to storage. `payload` is arbitrary JSON
/// held as a `serde_json::Value`; it is re-serialized on persistence and
/// delivery, so object key order is not byte-preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub stream_id: String,
}

impl Message {
    /// Generate a fresh message id in the `msg_<12 hex>` format.
    ///
    /// Drawn from the thread-local CSPRNG so ids are unguessable as well
    /// as unique within a topic.
    pub fn generate_id() -> String {
        let bytes: [u8; 6] = rand::rng().random();
        let mut id = String::with_capacity(16);
        id.push_str("msg_");
        for byte in bytes {
            id.push_str(&format!("{byte:02x}"));
        }
        id
    }
}

/// What the producer gets back once a message has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
}

/// Check a topic name against the allowed pattern.
pub fn validate_topic_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > TOPIC_NAME_MAX_LEN {
        return Err(ValidationError::InvalidTopicName);
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':'));
    if !valid {
        return Err(ValidationError::InvalidTopicName);
    }
    Ok(())
}

/// Check metadata entry counts and per-entry bounds.
pub fn validate_metadata(metadata: &HashMap<String, String>) -> Result<(), ValidationError> {
    if metadata.len() > METADATA_MAX_ENTRIES {
        return Err(ValidationError::InvalidMetadata);
    }
    for (key, value) in metadata {
        if key.is_empty()
            || key.len() > METADATA_KEY_MAX_LEN
            || value.len() > METADATA_VALUE_MAX_LEN
        {
            return Err(ValidationError::InvalidMetadata);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_have_expected_shape() {
        let id = Message::generate_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 16);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Message::generate_id();
        let b = Message::generate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn topic_names_accept_allowed_charset() {
        for name in ["notes", "orders.v2", "a-b_c:d", "X9"] {
            assert_eq!(validate_topic_name(name), Ok(()));
        }
    }

    #[test]
    fn topic_names_reject_bad_input() {
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("has space").is_err());
        assert!(validate_topic_name("emoji\u{1F600}").is_err());
        let long = "a".repeat(TOPIC_NAME_MAX_LEN + 1);
        assert!(validate_topic_name(&long).is_err());
    }

    #[test]
    fn metadata_bounds_are_enforced() {
        let mut metadata = HashMap::new();
        metadata.insert("priority".to_string(), "high".to_string());
        assert_eq!(validate_metadata(&metadata), Ok(()));

        metadata.insert("big".to_string(), "v".repeat(METADATA_VALUE_MAX_LEN + 1));
        assert!(validate_metadata(&metadata).is_err());
    }

    #[test]
    fn message_round_trips_through_json() {
        let message = Message {
            message_id: "msg_abc123def456".to_string(),
            topic: "notes".to_string(),
            payload: serde_json::json!({"n": 1}),
            timestamp: Utc::now(),
            ttl: Some(3600),
            metadata: HashMap::from([("k".to_string(), "v".to_string())]),
            stream_id: "1700000000000-0".to_string(),
        };
        let text = serde_json::to_string(&message).expect("serialize");
        let parsed: Message = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed, message);
    }
}
