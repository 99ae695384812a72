//! Shared domain model for Pulsar Relay.
//!
//! # Purpose
//! Defines the message, topic, and identity types that flow between the
//! storage backends, the routing engine, and the HTTP/WebSocket surface,
//! together with the validation rules they must satisfy.

pub mod auth;
pub mod message;
pub mod topic;

pub use auth::{AuthUser, Scope};
pub use message::{Message, PublishReceipt, ValidationError};
pub use topic::Topic;
