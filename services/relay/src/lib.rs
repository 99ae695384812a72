//! Pulsar Relay service library.
//!
//! # Purpose
//! Hosts the HTTP/WebSocket surface over the routing engine: request
//! handlers, the push-socket protocol, token verification, configuration,
//! and observability wiring. `main.rs` is a thin shell over [`app`].

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod observability;
pub mod ws;
