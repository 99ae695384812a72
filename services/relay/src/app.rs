//! HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers. Route composition lives here
//! to keep `main` small and testable.
use crate::api;
use crate::auth::JwtVerifier;
use crate::ws;
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_broker::{AuthzOracle, ConnectionManager, PollManager, Publisher};
use relay_storage::{MessageStore, TopicStore};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<Publisher>,
    pub polls: Arc<PollManager>,
    pub connections: Arc<ConnectionManager>,
    pub authz: Arc<AuthzOracle>,
    pub topic_store: Arc<dyn TopicStore>,
    pub message_store: Arc<dyn MessageStore>,
    pub jwt: JwtVerifier,
    pub metrics: PrometheusHandle,
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            )
        });

    Router::new()
        .route("/api/v1/messages", post(api::messages::create_message))
        .route(
            "/api/v1/messages/bulk",
            post(api::messages::create_bulk_messages),
        )
        .route("/messages/poll", post(api::polling::poll_messages))
        .route("/messages/poll/stats", get(api::polling::poll_stats))
        .route("/ws", get(ws::ws_handler))
        .route(
            "/api/v1/topics",
            get(api::topics::list_topics).post(api::topics::create_topic),
        )
        .route(
            "/api/v1/topics/:name",
            get(api::topics::get_topic)
                .put(api::topics::update_topic)
                .delete(api::topics::delete_topic),
        )
        .route(
            "/api/v1/topics/:name/permissions",
            get(api::topics::list_permissions).post(api::topics::grant_access),
        )
        .route(
            "/api/v1/topics/:name/permissions/:user_id",
            axum::routing::delete(api::topics::revoke_access),
        )
        .route("/health", get(api::system::health))
        .route("/ready", get(api::system::ready))
        .route("/metrics", get(api::system::metrics))
        .layer(trace_layer)
        .with_state(state)
}
