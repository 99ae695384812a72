//! Long-poll handlers: the pull-side consumer front end.
use crate::api::error::{self, ApiError};
use crate::api::types::{PollBody, PollResponseBody};
use crate::app::AppState;
use axum::Json;
use axum::extract::State;
use relay_broker::{Action, Decision};
use relay_core::AuthUser;
use std::time::Duration;

// Block until messages arrive on any requested topic or the timeout
// elapses. Catch-up from `since` cursors is served immediately.
pub async fn poll_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<PollBody>,
) -> Result<Json<PollResponseBody>, ApiError> {
    if body.topics.is_empty() {
        return Err(error::invalid_request("at least one topic required"));
    }
    // The whole request fails on the first denied topic.
    for topic in &body.topics {
        match state.authz.authorize(&user, topic, Action::Read).await? {
            Decision::Allow => {}
            Decision::DenyNoScope => {
                return Err(error::forbidden("token lacks the read scope"));
            }
            Decision::DenyNoAccess => {
                return Err(error::forbidden(&format!("access denied to topic '{topic}'")));
            }
            Decision::TopicNotFound => return Err(error::topic_not_found(topic)),
        }
    }
    let since = body.since.unwrap_or_default();
    let outcome = state
        .polls
        .poll(&body.topics, &since, Duration::from_secs(body.timeout))
        .await?;
    Ok(Json(PollResponseBody {
        messages: outcome.messages,
        has_more: outcome.has_more,
    }))
}

// Operational visibility into suspended pull clients.
pub async fn poll_stats(State(state): State<AppState>) -> Json<relay_broker::PollStats> {
    Json(state.polls.stats())
}
