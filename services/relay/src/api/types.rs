//! Request and response bodies for the HTTP API.
use chrono::{DateTime, Utc};
use relay_core::Topic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Deserialize)]
pub struct PublishBody {
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct BulkPublishBody {
    pub messages: Vec<PublishBody>,
}

#[derive(Debug, Deserialize)]
pub struct PollBody {
    pub topics: Vec<String>,
    #[serde(default)]
    pub since: Option<HashMap<String, String>>,
    /// Seconds to hold the request open; clamped server-side.
    #[serde(default = "default_poll_timeout")]
    pub timeout: u64,
}

fn default_poll_timeout() -> u64 {
    30
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponseBody {
    pub messages: Vec<relay_core::Message>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct TopicCreateBody {
    pub topic_name: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TopicUpdateBody {
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Topic record as returned by the API.
///
/// The grant list is only included for the owner (and admins).
#[derive(Debug, Serialize, Deserialize)]
pub struct TopicBody {
    pub topic_id: String,
    pub topic_name: String,
    pub owner_id: String,
    pub is_public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_user_ids: Option<BTreeSet<String>>,
}

impl TopicBody {
    pub fn from_topic(topic: Topic, include_grants: bool) -> Self {
        Self {
            topic_id: topic.topic_id,
            topic_name: topic.name,
            owner_id: topic.owner_id,
            is_public: topic.is_public,
            description: topic.description,
            created_at: topic.created_at,
            granted_user_ids: include_grants.then_some(topic.granted_user_ids),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GrantBody {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantResponseBody {
    pub topic_name: String,
    pub user_id: String,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyBody {
    pub ready: bool,
    pub checks: HashMap<String, String>,
}
