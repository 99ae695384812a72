//! Topic records.
//!
//! A topic is the unit of routing and access control. Records are created
//! through the topics API, never implicitly by publishing.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named routing key plus its access-control state.
///
/// The owner is always authorized. Everyone else is authorized iff the
/// topic is public (read only) or they appear in `granted_user_ids`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub topic_id: String,
    pub name: String,
    pub owner_id: String,
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub granted_user_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Topic {
    pub fn is_granted(&self, user_id: &str) -> bool {
        self.granted_user_ids.contains(user_id)
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(owner: &str, public: bool) -> Topic {
        Topic {
            topic_id: "t-1".to_string(),
            name: "notes".to_string(),
            owner_id: owner.to_string(),
            is_public: public,
            description: None,
            granted_user_ids: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ownership_and_grants() {
        let mut record = topic("alice", false);
        assert!(record.is_owner("alice"));
        assert!(!record.is_owner("bob"));
        assert!(!record.is_granted("bob"));

        record.granted_user_ids.insert("bob".to_string());
        assert!(record.is_granted("bob"));
    }
}
