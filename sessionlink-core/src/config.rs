use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Allowed CORS origins; empty allows any
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

/// Postgres settings. An empty `url` selects the in-memory call store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 20,
            min_connections: 2,
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 600,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Signaling relay tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Minimum spacing between persisted membership writes on join
    pub sync_throttle_ms: u64,
    /// Protocol-level WebSocket ping interval
    pub ws_ping_interval_seconds: u64,
    /// Sockets whose last client ping is older than this are closed
    pub stale_sweep_interval_seconds: u64,
    /// Per-connection outbound frame buffer
    pub outbound_buffer: usize,
    pub max_message_size: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            sync_throttle_ms: 3000,
            ws_ping_interval_seconds: 30,
            stale_sweep_interval_seconds: 300,
            outbound_buffer: 1000,
            max_message_size: 64 * 1024,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn sync_throttle(&self) -> Duration {
        Duration::from_millis(self.sync_throttle_ms)
    }

    #[must_use]
    pub const fn ws_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_seconds)
    }

    #[must_use]
    pub const fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_seconds)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SESSIONLINK_SERVER__HTTP_PORT, SESSIONLINK_DATABASE__URL, ...
        builder = builder.add_source(
            Environment::with_prefix("SESSIONLINK")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database.url
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}
