use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

pub const DEFAULT_MAX_MESSAGES_PER_TOPIC: u64 = 1_000_000;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_MAX_WAITERS: usize = 10_000;
pub const DEFAULT_RETENTION_SECONDS: u64 = 86_400;

/// Which message/topic persistence backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Valkey,
}

#[derive(Debug, Clone)]
pub struct ValkeySettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

// Relay configuration sourced from PULSAR_-prefixed environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    // HTTP bind address for the API, WebSocket, and metrics surface.
    pub bind_addr: SocketAddr,
    pub storage_backend: StorageBackend,
    pub valkey: ValkeySettings,
    // Retention horizon for the persistent tier, in seconds.
    pub retention_seconds: u64,
    pub max_messages_per_topic: u64,
    pub max_message_size: usize,
    pub max_connections: usize,
    pub max_waiters: usize,
    pub log_level: String,
    // HS256 secret for verifying producer/consumer tokens.
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct RelayConfigOverride {
    bind_addr: Option<String>,
    storage_backend: Option<String>,
    valkey_host: Option<String>,
    valkey_port: Option<u16>,
    valkey_use_tls: Option<bool>,
    max_messages_per_topic: Option<u64>,
    max_message_size: Option<usize>,
    log_level: Option<String>,
}

fn parse_backend(raw: &str) -> Result<StorageBackend> {
    match raw {
        "memory" => Ok(StorageBackend::Memory),
        "valkey" => Ok(StorageBackend::Valkey),
        other => bail!("unknown storage backend '{other}' (expected memory or valkey)"),
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("PULSAR_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse PULSAR_BIND")?;
        let storage_backend = parse_backend(
            &std::env::var("PULSAR_STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string()),
        )?;
        let valkey = ValkeySettings {
            host: std::env::var("PULSAR_VALKEY_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("PULSAR_VALKEY_PORT")
                .unwrap_or_else(|_| "6379".to_string())
                .parse()
                .with_context(|| "parse PULSAR_VALKEY_PORT")?,
            use_tls: std::env::var("PULSAR_VALKEY_USE_TLS")
                .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        };
        let retention_seconds = env_number("PULSAR_PERSISTENT_TIER_RETENTION", DEFAULT_RETENTION_SECONDS)?;
        let max_messages_per_topic =
            env_number("PULSAR_MAX_MESSAGES_PER_TOPIC", DEFAULT_MAX_MESSAGES_PER_TOPIC)?;
        let max_message_size = env_number("PULSAR_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?;
        let max_connections = env_number("PULSAR_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let max_waiters = env_number("PULSAR_MAX_WAITERS", DEFAULT_MAX_WAITERS)?;
        let log_level = std::env::var("PULSAR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        // Tokens cannot be verified without the shared secret.
        let jwt_secret =
            std::env::var("PULSAR_JWT_SECRET_KEY").with_context(|| "PULSAR_JWT_SECRET_KEY is required")?;
        Ok(Self {
            bind_addr,
            storage_backend,
            valkey,
            retention_seconds,
            max_messages_per_topic,
            max_message_size,
            max_connections,
            max_waiters,
            log_level,
            jwt_secret,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("PULSAR_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read PULSAR_CONFIG: {path}"))?;
            let override_cfg: RelayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse relay config yaml")?;
            if let Some(value) = override_cfg.bind_addr {
                config.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
            }
            if let Some(value) = override_cfg.storage_backend {
                config.storage_backend = parse_backend(&value)?;
            }
            if let Some(value) = override_cfg.valkey_host {
                config.valkey.host = value;
            }
            if let Some(value) = override_cfg.valkey_port {
                config.valkey.port = value;
            }
            if let Some(value) = override_cfg.valkey_use_tls {
                config.valkey.use_tls = value;
            }
            if let Some(value) = override_cfg.max_messages_per_topic {
                config.max_messages_per_topic = value;
            }
            if let Some(value) = override_cfg.max_message_size {
                config.max_message_size = value;
            }
            if let Some(value) = override_cfg.log_level {
                config.log_level = value;
            }
        }
        Ok(config)
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("parse {key}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    // Helper to clear all relay env vars between cases.
    fn clear_pulsar_env() {
        for (key, _) in env::vars() {
            if key.starts_with("PULSAR_") {
                unsafe {
                    env::remove_var(key);
                }
            }
        }
    }

    fn set_secret() {
        unsafe {
            env::set_var("PULSAR_JWT_SECRET_KEY", "test-secret");
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_pulsar_env();
        set_secret();
        let config = RelayConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.valkey.host, "localhost");
        assert_eq!(config.valkey.port, 6379);
        assert_eq!(config.max_messages_per_topic, DEFAULT_MAX_MESSAGES_PER_TOPIC);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        clear_pulsar_env();
    }

    #[serial]
    #[test]
    fn missing_jwt_secret_is_fatal() {
        clear_pulsar_env();
        assert!(RelayConfig::from_env().is_err());
    }

    #[serial]
    #[test]
    fn from_env_respects_env_vars() {
        clear_pulsar_env();
        set_secret();
        unsafe {
            env::set_var("PULSAR_BIND", "127.0.0.1:9090");
            env::set_var("PULSAR_STORAGE_BACKEND", "valkey");
            env::set_var("PULSAR_VALKEY_HOST", "valkey.internal");
            env::set_var("PULSAR_VALKEY_PORT", "7000");
            env::set_var("PULSAR_VALKEY_USE_TLS", "true");
            env::set_var("PULSAR_MAX_MESSAGES_PER_TOPIC", "5000");
        }
        let config = RelayConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9090");
        assert_eq!(config.storage_backend, StorageBackend::Valkey);
        assert_eq!(config.valkey.host, "valkey.internal");
        assert_eq!(config.valkey.port, 7000);
        assert!(config.valkey.use_tls);
        assert_eq!(config.max_messages_per_topic, 5000);
        clear_pulsar_env();
    }

    #[serial]
    #[test]
    fn unknown_backend_is_rejected() {
        clear_pulsar_env();
        set_secret();
        unsafe {
            env::set_var("PULSAR_STORAGE_BACKEND", "cassandra");
        }
        assert!(RelayConfig::from_env().is_err());
        clear_pulsar_env();
    }

    #[serial]
    #[test]
    fn yaml_override_wins_over_env() {
        clear_pulsar_env();
        set_secret();
        let dir = std::env::temp_dir().join(format!("relay-config-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("tmp dir");
        let path = dir.join("relay.yml");
        fs::write(
            &path,
            "bind_addr: \"127.0.0.1:7443\"\nmax_message_size: 2048\nlog_level: debug\n",
        )
        .expect("write yaml");
        unsafe {
            env::set_var("PULSAR_CONFIG", path.to_str().expect("path"));
        }
        let config = RelayConfig::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7443");
        assert_eq!(config.max_message_size, 2048);
        assert_eq!(config.log_level, "debug");
        let _ = fs::remove_dir_all(&dir);
        clear_pulsar_env();
    }

    #[serial]
    #[test]
    fn missing_yaml_file_fails() {
        clear_pulsar_env();
        set_secret();
        unsafe {
            env::set_var("PULSAR_CONFIG", "/nonexistent/relay.yml");
        }
        assert!(RelayConfig::from_env_or_yaml().is_err());
        clear_pulsar_env();
    }
}
