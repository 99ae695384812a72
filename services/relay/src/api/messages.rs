//! Message ingestion handlers.
use crate::api::error::ApiError;
use crate::api::types::{BulkPublishBody, PublishBody};
use crate::app::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use relay_broker::PublishRequest;
use relay_core::AuthUser;

fn to_request(body: PublishBody) -> PublishRequest {
    PublishRequest {
        topic: body.topic,
        payload: body.payload,
        ttl: body.ttl,
        metadata: body.metadata,
    }
}

// Publish a single message: 201 with the receipt on success. The receipt
// carries the server-assigned message id, so producer retries are new
// messages, not replays.
pub async fn create_message(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<PublishBody>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state.publisher.publish(&user, to_request(body)).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// Bulk publish: access to every topic is required up front, after which
// entries succeed or fail independently (207 Multi-Status).
pub async fn create_bulk_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<BulkPublishBody>,
) -> Result<impl IntoResponse, ApiError> {
    let requests = body.messages.into_iter().map(to_request).collect();
    let outcome = state.publisher.publish_bulk(&user, requests).await?;
    Ok((StatusCode::MULTI_STATUS, Json(outcome)))
}
