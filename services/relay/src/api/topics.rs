//! Topic management handlers.
//!
//! Topics are created explicitly here, never implicitly by publishing.
//! The creator becomes the owner; only the owner (or an admin) may
//! update, delete, or manage grants.
use crate::api::error::{self, ApiError};
use crate::api::types::{GrantBody, GrantResponseBody, TopicBody, TopicCreateBody, TopicUpdateBody};
use crate::app::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use relay_core::{AuthUser, Scope, Topic, message};
use relay_storage::TopicStore;
use std::collections::BTreeSet;
use uuid::Uuid;

async fn owned_topic(state: &AppState, user: &AuthUser, name: &str) -> Result<Topic, ApiError> {
    let topic = state
        .topic_store
        .get(name)
        .await?
        .ok_or_else(|| error::topic_not_found(name))?;
    if !topic.is_owner(&user.user_id) && !user.is_admin() {
        return Err(error::forbidden("only the topic owner can do this"));
    }
    Ok(topic)
}

pub async fn create_topic(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<TopicCreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !user.has_scope(Scope::Write) {
        return Err(error::forbidden("token lacks the write scope"));
    }
    message::validate_topic_name(&body.topic_name)
        .map_err(|err| error::invalid_request(&err.to_string()))?;
    let topic = Topic {
        topic_id: Uuid::new_v4().to_string(),
        name: body.topic_name,
        owner_id: user.user_id.clone(),
        is_public: body.is_public,
        description: body.description,
        granted_user_ids: BTreeSet::new(),
        created_at: Utc::now(),
    };
    let created = state.topic_store.create(topic).await?;
    tracing::info!(topic = %created.name, owner = %user.username, "topic created");
    Ok((StatusCode::CREATED, Json(TopicBody::from_topic(created, true))))
}

// List the topics the caller owns or has been granted.
pub async fn list_topics(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<TopicBody>>, ApiError> {
    let topics = state.topic_store.list_for_user(&user.user_id).await?;
    let bodies = topics
        .into_iter()
        .map(|topic| {
            let include_grants = topic.is_owner(&user.user_id) || user.is_admin();
            TopicBody::from_topic(topic, include_grants)
        })
        .collect();
    Ok(Json(bodies))
}

pub async fn get_topic(
    Path(name): Path<String>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<TopicBody>, ApiError> {
    let topic = state
        .topic_store
        .get(&name)
        .await?
        .ok_or_else(|| error::topic_not_found(&name))?;
    let readable = user.is_admin()
        || topic.is_public
        || topic.is_owner(&user.user_id)
        || topic.is_granted(&user.user_id);
    if !readable {
        return Err(error::forbidden(&format!("access denied to topic '{name}'")));
    }
    let include_grants = topic.is_owner(&user.user_id) || user.is_admin();
    Ok(Json(TopicBody::from_topic(topic, include_grants)))
}

pub async fn update_topic(
    Path(name): Path<String>,
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<TopicUpdateBody>,
) -> Result<Json<TopicBody>, ApiError> {
    owned_topic(&state, &user, &name).await?;
    let updated = state
        .topic_store
        .update(&name, body.is_public, body.description)
        .await?;
    Ok(Json(TopicBody::from_topic(updated, true)))
}

// Deleting a topic also drops its retained messages.
pub async fn delete_topic(
    Path(name): Path<String>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<StatusCode, ApiError> {
    owned_topic(&state, &user, &name).await?;
    state.topic_store.delete(&name).await?;
    tracing::info!(topic = %name, by = %user.username, "topic deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn grant_access(
    Path(name): Path<String>,
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<GrantBody>,
) -> Result<impl IntoResponse, ApiError> {
    owned_topic(&state, &user, &name).await?;
    // Identity is the token subject; grants are keyed by that name.
    state.topic_store.grant(&name, &body.username).await?;
    tracing::info!(topic = %name, user = %body.username, "access granted");
    Ok((
        StatusCode::CREATED,
        Json(GrantResponseBody {
            topic_name: name,
            user_id: body.username,
            granted_at: Utc::now(),
        }),
    ))
}

pub async fn revoke_access(
    Path((name, user_id)): Path<(String, String)>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<StatusCode, ApiError> {
    owned_topic(&state, &user, &name).await?;
    state.topic_store.revoke(&name, &user_id).await?;
    tracing::info!(topic = %name, user = %user_id, "access revoked");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_permissions(
    Path(name): Path<String>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<String>>, ApiError> {
    let topic = owned_topic(&state, &user, &name).await?;
    Ok(Json(topic.granted_user_ids.into_iter().collect()))
}
