//! Authenticated identity as carried by verified tokens.
//!
//! The relay stores no user accounts; whatever issued the JWT is the
//! source of truth. A user is entirely described by the claims: a stable
//! subject id, a display username, and a scope set.
use serde::{Deserialize, Serialize};

/// Capability granted to a token.
///
/// `Admin` implies both `Read` and `Write` and additionally bypasses
/// topic-level ownership checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Admin,
}

/// Identity resolved from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub scopes: Vec<Scope>,
}

impl AuthUser {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        scopes: Vec<Scope>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            scopes,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.scopes.contains(&Scope::Admin)
    }

    /// Admin tokens carry every capability.
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.is_admin() || self.scopes.contains(&scope)
    }
}
