//! Liveness, readiness, and metrics endpoints.
use crate::api::types::{HealthBody, ReadyBody};
use crate::app::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use relay_storage::MessageStore;
use std::collections::HashMap;

pub async fn health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// Readiness probes the storage backend; a relay that cannot persist is
// not ready to accept publishes.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    let storage_ok = match state.message_store.health_check().await {
        Ok(()) => {
            checks.insert(
                "storage".to_string(),
                format!("{} ok", state.message_store.backend_name()),
            );
            true
        }
        Err(err) => {
            checks.insert("storage".to_string(), err.to_string());
            false
        }
    };
    let status = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadyBody { ready: storage_ok, checks }))
}

// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}
