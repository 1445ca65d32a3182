//! Configuration system for the notification pipeline.
//!
//! TOML-based configuration with environment variable override support.

use mp_common::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub store: StoreConfig,
    pub redis: RedisConfig,
    pub ingest: IngestConfig,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    pub standby: StandbyConfig,
    pub auth: AuthConfig,
    pub data_dir: String,
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            store: StoreConfig::default(),
            redis: RedisConfig::default(),
            ingest: IngestConfig::default(),
            pipeline: PipelineConfig {
                rate_limits: Default::default(),
                queue: Default::default(),
                retry: Default::default(),
                circuit_breaker: Default::default(),
                dedup: Default::default(),
                timers: Default::default(),
                targets: mp_common::TargetsConfig {
                    chat_webhook_url: String::new(),
                    chat_signing_secret: None,
                },
            },
            standby: StandbyConfig::default(),
            auth: AuthConfig::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["http://localhost:4200".to_string()],
        }
    }
}

/// Durable store (queue + profile + interest index) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx connection string, e.g. `sqlite://./data/pipeline.db` or a postgres URL.
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/pipeline.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

/// Event Source Adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub source_url: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub heartbeat_interval_ms: u64,
    pub healthy_window_secs: u64,
    pub parse_error_ratio_threshold: f64,
    pub parse_error_window: u32,
    pub circuit_breaker_reset_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            heartbeat_interval_ms: 15_000,
            healthy_window_secs: 60,
            parse_error_ratio_threshold: 0.1,
            parse_error_window: 100,
            circuit_breaker_reset_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbyConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub lock_key: String,
    pub lock_ttl_seconds: u64,
    pub heartbeat_interval_seconds: u64,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: String::new(),
            lock_key: "market-pulse:leader".to_string(),
            lock_ttl_seconds: 30,
            heartbeat_interval_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// `none` or `bearer`
    pub mode: String,
    pub bearer_token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: "none".to_string(),
            bearer_token: String::new(),
        }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn example_toml() -> String {
        r#"# Market Pulse notification pipeline configuration
# Environment variables override these settings.

[http]
port = 8080
host = "0.0.0.0"
cors_origins = ["http://localhost:4200"]

[store]
database_url = "sqlite://./data/pipeline.db?mode=rwc"
max_connections = 10

[redis]
url = "redis://localhost:6379"
pool_size = 10

[ingest]
source_url = "wss://example-feed.invalid/stream"
initial_backoff_ms = 1000
max_backoff_ms = 30000
backoff_multiplier = 2.0
heartbeat_interval_ms = 15000
healthy_window_secs = 60
parse_error_ratio_threshold = 0.1
parse_error_window = 100
circuit_breaker_reset_ms = 10000

[rate_limits]
global_rps = 50
global_burst = 100
per_recipient_rps = 2
per_recipient_burst = 5

[queue]
max_ready_capacity = 100000
max_concurrent_dispatch = 64
coalesce_threshold = 5
dead_letter_retention_hours = 72

[retry]
base_delay_ms = 1000
multiplier = 2.0
max_delay_ms = 300000
max_attempts = 8

[circuit_breaker]
failure_threshold = 5
success_threshold = 2
reset_timeout_ms = 5000
max_reset_timeout_ms = 120000
half_open_probe_calls = 3

[dedup]
ttl_seconds = 3600

[timers]
promote_tick_ms = 100
sweep_tick_ms = 1000
metrics_tick_ms = 10000
shutdown_deadline_secs = 30

[targets]
chat_webhook_url = ""
chat_signing_secret = ""

[standby]
enabled = false
redis_url = ""
lock_key = "market-pulse:leader"
lock_ttl_seconds = 30
heartbeat_interval_seconds = 10

[auth]
mode = "none"
bearer_token = ""

data_dir = "./data"
dev_mode = false
"#
        .to_string()
    }
}
