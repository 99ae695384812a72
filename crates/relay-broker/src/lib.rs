//! Message routing engine for Pulsar Relay.
//!
//! # Purpose
//! Everything between the HTTP/WebSocket surface and the storage layer:
//! - [`authz`]: the owner/public/grant authorization oracle.
//! - [`connections`]: the live push-subscriber registry and broadcast.
//! - [`polling`]: suspended long-poll waiters with catch-up semantics.
//! - [`publish`]: the validate → authorize → persist → fan-out pipeline.
//!
//! The connection and poll registries each sit behind exactly one mutex,
//! never nested, and the pipeline holds neither while fanning out.

pub mod authz;
pub mod connections;
pub mod polling;
pub mod publish;

pub use authz::{Action, AuthzOracle, Decision};
pub use connections::{ConnectionError, ConnectionId, ConnectionManager, PushConnection};
pub use polling::{PollError, PollManager, PollOutcome, PollStats};
pub use publish::{BulkEntryOutcome, BulkOutcome, PublishError, PublishRequest, Publisher};
