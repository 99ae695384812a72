use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static OBS_INIT: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber and the Prometheus recorder.
///
/// Idempotent so tests can call it freely; the first caller wins. The
/// returned handle renders the metrics exposition text for `/metrics`.
pub fn init_observability(default_level: &str) -> PrometheusHandle {
    let default_level = default_level.to_string();
    OBS_INIT.get_or_init(|| {
        // RUST_LOG takes precedence for targeted filtering; the configured
        // level is the fallback.
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        let fmt_layer = tracing_subscriber::fmt::layer();
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    });
    install_metrics_recorder()
}

fn install_metrics_recorder() -> PrometheusHandle {
    if let Some(handle) = METRICS_HANDLE.get() {
        return handle.clone();
    }
    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        // A recorder may already be installed by an earlier init in the
        // same process; fall back to a detached handle for rendering.
        Err(_) => PrometheusBuilder::new().build_recorder().handle(),
    };
    let _ = METRICS_HANDLE.set(handle.clone());
    handle
}
