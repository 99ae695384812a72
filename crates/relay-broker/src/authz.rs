//! Topic authorization oracle.
//!
//! # Purpose
//! Answers "may user U read/write topic T?" against the topic registry.
//! Consulted on every publish, every subscribe frame, and every poll.
//!
//! # Rules
//! - The topic must exist; publishing never creates one.
//! - The required scope (`read` or `write`) must be present on the token.
//! - Admin tokens then pass; otherwise the owner and explicit grantees
//!   pass, and `is_public` additionally allows reads. Public never
//!   implies write access.
use relay_core::{AuthUser, Scope};
use relay_storage::{StorageError, TopicStore};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
}

impl Action {
    fn required_scope(self) -> Scope {
        match self {
            Action::Read => Scope::Read,
            Action::Write => Scope::Write,
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// The token lacks the required capability.
    DenyNoScope,
    /// The topic is private and the user is neither owner nor grantee.
    DenyNoAccess,
    TopicNotFound,
}

pub struct AuthzOracle {
    topics: Arc<dyn TopicStore>,
}

impl AuthzOracle {
    pub fn new(topics: Arc<dyn TopicStore>) -> Self {
        Self { topics }
    }

    pub async fn authorize(
        &self,
        user: &AuthUser,
        topic: &str,
        action: Action,
    ) -> Result<Decision, StorageError> {
        let Some(record) = self.topics.get(topic).await? else {
            return Ok(Decision::TopicNotFound);
        };
        if !user.has_scope(action.required_scope()) {
            return Ok(Decision::DenyNoScope);
        }
        if user.is_admin() {
            return Ok(Decision::Allow);
        }
        let allowed = match action {
            Action::Read => {
                record.is_public || record.is_owner(&user.user_id) || record.is_granted(&user.user_id)
            }
            Action::Write => record.is_owner(&user.user_id) || record.is_granted(&user.user_id),
        };
        if allowed {
            Ok(Decision::Allow)
        } else {
            Ok(Decision::DenyNoAccess)
        }
    }
}
