//! Shared fixtures for the service-level tests: an in-memory app
//! instance, token minting, and request/response helpers.
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use relay_broker::{AuthzOracle, ConnectionManager, PollManager, Publisher};
use relay_core::{Scope, Topic};
use relay_server::app::{AppState, build_router};
use relay_server::auth::{Claims, JwtVerifier};
use relay_server::observability;
use relay_storage::{MemoryMessageStore, MemoryTopicStore, MessageStore, TopicStore};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const TEST_SECRET: &str = "integration-test-secret";

pub fn token_for(user_id: &str, scopes: Vec<Scope>) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        username: user_id.to_string(),
        permissions: scopes,
        exp: now + 3600,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("encode token")
}

pub fn read_write_token(user_id: &str) -> String {
    token_for(user_id, vec![Scope::Read, Scope::Write])
}

pub fn test_app(max_message_size: usize) -> (Router, AppState) {
    let metrics = observability::init_observability("warn");
    let message_store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new(10_000));
    let topic_store: Arc<dyn TopicStore> = Arc::new(MemoryTopicStore::new());
    let authz = Arc::new(AuthzOracle::new(topic_store.clone()));
    let connections = Arc::new(ConnectionManager::new(100, 64));
    let polls = Arc::new(PollManager::new(message_store.clone(), 100));
    let publisher = Arc::new(Publisher::new(
        message_store.clone(),
        authz.clone(),
        connections.clone(),
        polls.clone(),
        max_message_size,
    ));
    let state = AppState {
        publisher,
        polls,
        connections,
        authz,
        topic_store,
        message_store,
        jwt: JwtVerifier::new(TEST_SECRET),
        metrics,
    };
    (build_router(state.clone()), state)
}

pub async fn seed_topic(state: &AppState, name: &str, owner: &str, public: bool, grants: &[&str]) {
    state
        .topic_store
        .create(Topic {
            topic_id: format!("t-{name}"),
            name: name.to_string(),
            owner_id: owner.to_string(),
            is_public: public,
            description: None,
            granted_user_ids: grants.iter().map(|g| g.to_string()).collect::<BTreeSet<_>>(),
            created_at: Utc::now(),
        })
        .await
        .expect("seed topic");
}

pub fn json_request(method: &str, uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}
