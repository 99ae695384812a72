// Pulsar Relay
// ------------
// Real-time message fan-out: producers publish JSON messages to topics
// over HTTP; consumers receive them over a persistent WebSocket (push)
// or a blocking poll request (pull). Messages are durably appended to a
// per-topic stream in Valkey (or kept in memory for development) and
// fanned out in-process to currently connected subscribers.
//
// Startup order matters: storage first, then the authorization oracle on
// top of the topic registry, then the connection and poll registries,
// and finally the HTTP surface over all of them.
use anyhow::Result;
use relay_broker::{AuthzOracle, ConnectionManager, PollManager, Publisher};
use relay_server::app::{AppState, build_router};
use relay_server::auth::JwtVerifier;
use relay_server::config::{RelayConfig, StorageBackend};
use relay_server::observability;
use relay_storage::{
    MemoryMessageStore, MemoryTopicStore, MessageStore, TopicStore, ValkeyMessageStore,
    ValkeyTopicStore, connect,
};
use std::sync::Arc;
use std::time::Duration;

// Per-connection outbound frame buffer; a consumer that falls this far
// behind is treated as dead.
const PUSH_CHANNEL_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::from_env_or_yaml()?;
    let metrics_handle = observability::init_observability(&config.log_level);

    let (message_store, topic_store): (Arc<dyn MessageStore>, Arc<dyn TopicStore>) =
        match config.storage_backend {
            StorageBackend::Memory => (
                Arc::new(MemoryMessageStore::new(config.max_messages_per_topic as usize)),
                Arc::new(MemoryTopicStore::new()),
            ),
            StorageBackend::Valkey => {
                let conn = connect(&config.valkey.host, config.valkey.port, config.valkey.use_tls)
                    .await
                    .map_err(|err| anyhow::anyhow!("valkey connection failed: {err}"))?;
                (
                    Arc::new(ValkeyMessageStore::new(
                        conn.clone(),
                        config.max_messages_per_topic,
                    )),
                    Arc::new(ValkeyTopicStore::new(conn)),
                )
            }
        };
    tracing::info!(
        backend = message_store.backend_name(),
        "storage backend ready"
    );

    let authz = Arc::new(AuthzOracle::new(topic_store.clone()));
    let connections = Arc::new(ConnectionManager::new(
        config.max_connections,
        PUSH_CHANNEL_CAPACITY,
    ));
    let polls = Arc::new(PollManager::new(message_store.clone(), config.max_waiters));
    polls.spawn_sweeper(SWEEP_INTERVAL);
    let publisher = Arc::new(Publisher::new(
        message_store.clone(),
        authz.clone(),
        connections.clone(),
        polls.clone(),
        config.max_message_size,
    ));

    let state = AppState {
        publisher,
        polls,
        connections,
        authz,
        topic_store,
        message_store,
        jwt: JwtVerifier::new(&config.jwt_secret),
        metrics: metrics_handle,
    };

    let app = build_router(state);
    let addr = config.bind_addr;
    tracing::info!(%addr, "pulsar relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
