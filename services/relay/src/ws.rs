//! Push-socket consumer front end.
//!
//! # Protocol
//! JSON frames over WebSocket. The token is presented as a query
//! parameter and verified before the upgrade. The first frame must be
//! `subscribe`; after a successful subscription the session is active and
//! accepts further `subscribe`, `unsubscribe`, `ack`, and `ping` frames
//! while the server pushes `message` frames as publishes land.
//!
//! # Liveness
//! The server pings every 30 s and closes the connection when no inbound
//! traffic has been seen for two intervals. Push offers no resume token;
//! clients needing gap-free delivery reconnect and use the poll endpoint
//! with `since`.
use crate::api::error;
use crate::app::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use relay_broker::{Action, Decision, PushConnection};
use relay_core::{AuthUser, Message, message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "subscribe")]
    Subscribe {
        topics: Vec<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },
    #[serde(rename = "ack")]
    Ack { message_id: String },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "subscribed")]
    Subscribed {
        topics: Vec<String>,
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { topics: Vec<String> },
    #[serde(rename = "message")]
    Message {
        message_id: String,
        topic: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
        metadata: HashMap<String, String>,
        stream_id: String,
    },
    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerFrame {
    fn message(message: &Message) -> Self {
        ServerFrame::Message {
            message_id: message.message_id.clone(),
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            timestamp: message.timestamp,
            metadata: message.metadata.clone(),
            stream_id: message.stream_id.clone(),
        }
    }

    fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

// Token and capacity are checked before the upgrade so rejected clients
// get a proper HTTP status instead of an immediately closed socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = query.token else {
        return error::unauthorized("missing token query parameter").into_response();
    };
    let user = match state.jwt.verify(&token) {
        Ok(user) => user,
        Err(err) => return error::unauthorized(&err.to_string()).into_response(),
    };
    if state.connections.at_capacity() {
        return error::service_unavailable("connection limit reached").into_response();
    }
    ws.on_upgrade(move |socket| session(socket, state, user))
}

async fn session(mut socket: WebSocket, state: AppState, user: AuthUser) {
    // Claim the slot only once the upgrade succeeded; a connection that
    // never finishes its handshake must not pin a registry entry.
    let connection: PushConnection = match state.connections.connect() {
        Ok(connection) => connection,
        Err(_) => {
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };
    let session_id = format!("sess_{}", Uuid::new_v4().simple());
    let conn_id = connection.id;
    let mut frames = connection.frames;
    let (mut sink, mut stream) = socket.split();
    tracing::info!(%session_id, user = %user.username, "push connection accepted");

    // Not yet subscribed: the only acceptable first frame is `subscribe`.
    let mut active = false;
    let mut last_seen = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_seen = Instant::now();
                        if !handle_text_frame(&state, &user, conn_id, &session_id, &mut active, &text, &mut sink).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        last_seen = Instant::now();
                        if sink.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Binary(_))) => {
                        if !send_frame(&mut sink, &ServerFrame::error("INVALID_MESSAGE", "expected text frames")).await {
                            break;
                        }
                        if !active {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!(%session_id, error = %err, "socket read error");
                        break;
                    }
                }
            }
            outbound = frames.recv() => {
                match outbound {
                    Some(message) => {
                        if !send_frame(&mut sink, &ServerFrame::message(&message)).await {
                            break;
                        }
                    }
                    // The registry pruned us as a dead/slow consumer.
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > HEARTBEAT_INTERVAL * 2 {
                    tracing::info!(%session_id, "closing unresponsive push connection");
                    break;
                }
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.connections.disconnect(conn_id);
    tracing::info!(%session_id, "push connection closed");
}

/// Dispatch one inbound text frame. Returns `false` when the session
/// should close.
async fn handle_text_frame(
    state: &AppState,
    user: &AuthUser,
    conn_id: relay_broker::ConnectionId,
    session_id: &str,
    active: &mut bool,
    text: &str,
    sink: &mut SessionSink,
) -> bool {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            let sent = send_frame(
                sink,
                &ServerFrame::error("INVALID_MESSAGE", format!("unparseable frame: {err}")),
            )
            .await;
            // Before the first subscription a malformed frame ends the
            // session; afterwards the session survives it.
            return sent && *active;
        }
    };

    match frame {
        ClientFrame::Subscribe { topics, client_id } => {
            if topics.is_empty() {
                return send_frame(
                    sink,
                    &ServerFrame::error("INVALID_MESSAGE", "topics must be non-empty"),
                )
                .await;
            }
            // All-or-nothing: one denied topic rejects the whole frame
            // and registers nothing from it.
            for topic in &topics {
                if message::validate_topic_name(topic).is_err() {
                    return send_frame(
                        sink,
                        &ServerFrame::error("INVALID_MESSAGE", format!("invalid topic name '{topic}'")),
                    )
                    .await;
                }
                let decision = match state.authz.authorize(user, topic, Action::Read).await {
                    Ok(decision) => decision,
                    Err(err) => {
                        tracing::error!(session_id, error = %err, "authorization lookup failed");
                        return send_frame(
                            sink,
                            &ServerFrame::error("STORAGE_UNAVAILABLE", "authorization unavailable"),
                        )
                        .await;
                    }
                };
                match decision {
                    Decision::Allow => {}
                    Decision::TopicNotFound => {
                        return send_frame(
                            sink,
                            &ServerFrame::error("TOPIC_NOT_FOUND", format!("topic '{topic}' not found")),
                        )
                        .await;
                    }
                    Decision::DenyNoScope | Decision::DenyNoAccess => {
                        return send_frame(
                            sink,
                            &ServerFrame::error("FORBIDDEN", format!("access denied to topic '{topic}'")),
                        )
                        .await;
                    }
                }
            }
            state.connections.subscribe(conn_id, &topics);
            *active = true;
            tracing::info!(session_id, ?topics, ?client_id, "subscribed");
            send_frame(
                sink,
                &ServerFrame::Subscribed {
                    topics,
                    session_id: session_id.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await
        }
        ClientFrame::Unsubscribe { topics } => {
            if !*active {
                let _ = send_frame(
                    sink,
                    &ServerFrame::error("INVALID_MESSAGE", "first frame must be subscribe"),
                )
                .await;
                return false;
            }
            state.connections.unsubscribe(conn_id, &topics);
            send_frame(sink, &ServerFrame::Unsubscribed { topics }).await
        }
        ClientFrame::Ack { message_id } => {
            if !*active {
                let _ = send_frame(
                    sink,
                    &ServerFrame::error("INVALID_MESSAGE", "first frame must be subscribe"),
                )
                .await;
                return false;
            }
            // Acks are advisory; delivery was already committed.
            metrics::counter!("relay_ws_acks_total").increment(1);
            tracing::debug!(session_id, %message_id, "message acknowledged");
            true
        }
        ClientFrame::Ping => {
            if !*active {
                let _ = send_frame(
                    sink,
                    &ServerFrame::error("INVALID_MESSAGE", "first frame must be subscribe"),
                )
                .await;
                return false;
            }
            send_frame(sink, &ServerFrame::Pong { timestamp: Utc::now() }).await
        }
    }
}

type SessionSink = SplitSink<WebSocket, WsMessage>;

async fn send_frame(sink: &mut SessionSink, frame: &ServerFrame) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode server frame");
            return false;
        }
    };
    sink.send(WsMessage::Text(text)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_by_type_tag() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"subscribe","topics":["notes"],"client_id":"cli-1"}"#,
        )
        .expect("parse");
        assert!(matches!(frame, ClientFrame::Subscribe { ref topics, .. } if topics == &["notes"]));

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).expect("parse");
        assert!(matches!(frame, ClientFrame::Ping));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn server_frames_carry_the_type_tag() {
        let frame = ServerFrame::Subscribed {
            topics: vec!["notes".to_string()],
            session_id: "sess_1".to_string(),
            timestamp: Utc::now(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).expect("serialize")).expect("parse");
        assert_eq!(value["type"], "subscribed");
        assert_eq!(value["topics"][0], "notes");

        let frame = ServerFrame::error("FORBIDDEN", "access denied to topic 'x'");
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).expect("serialize")).expect("parse");
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "FORBIDDEN");
    }
}
