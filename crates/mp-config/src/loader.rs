//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "market-pulse.toml",
    "./config/config.toml",
    "/etc/market-pulse/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("MP_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("MP_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("MP_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("MP_CORS_ORIGINS") {
            config.http.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Ok(val) = env::var("MP_DATABASE_URL") {
            config.store.database_url = val;
        }

        if let Ok(val) = env::var("MP_REDIS_URL") {
            config.redis.url = val.clone();
            config.standby.redis_url = val;
        }

        if let Ok(val) = env::var("MP_INGEST_SOURCE_URL") {
            config.ingest.source_url = val;
        }

        if let Ok(val) = env::var("MP_RATE_LIMIT_GLOBAL_RPS") {
            if let Ok(n) = val.parse() {
                config.pipeline.rate_limits.global_rps = n;
            }
        }
        if let Ok(val) = env::var("MP_RATE_LIMIT_GLOBAL_BURST") {
            if let Ok(n) = val.parse() {
                config.pipeline.rate_limits.global_burst = n;
            }
        }
        if let Ok(val) = env::var("MP_RATE_LIMIT_PER_RECIPIENT_RPS") {
            if let Ok(n) = val.parse() {
                config.pipeline.rate_limits.per_recipient_rps = n;
            }
        }
        if let Ok(val) = env::var("MP_RATE_LIMIT_PER_RECIPIENT_BURST") {
            if let Ok(n) = val.parse() {
                config.pipeline.rate_limits.per_recipient_burst = n;
            }
        }

        if let Ok(val) = env::var("MP_QUEUE_MAX_CONCURRENT_DISPATCH") {
            if let Ok(n) = val.parse() {
                config.pipeline.queue.max_concurrent_dispatch = n;
            }
        }

        if let Ok(val) = env::var("MP_TARGETS_CHAT_WEBHOOK_URL") {
            config.pipeline.targets.chat_webhook_url = val;
        }
        if let Ok(val) = env::var("MP_TARGETS_CHAT_SIGNING_SECRET") {
            config.pipeline.targets.chat_signing_secret = Some(val);
        }

        if let Ok(val) = env::var("MP_STANDBY_ENABLED") {
            config.standby.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("MP_STANDBY_LOCK_KEY") {
            config.standby.lock_key = val;
        }

        if let Ok(val) = env::var("MP_AUTH_MODE") {
            config.auth.mode = val;
        }
        if let Ok(val) = env::var("MP_AUTH_BEARER_TOKEN") {
            config.auth.bearer_token = val;
        }

        if let Ok(val) = env::var("MP_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("MP_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_or_env() {
        let loader = ConfigLoader::new();
        let config = loader.load().expect("defaults always load");
        assert_eq!(config.http.port, 8080);
    }

    #[test]
    fn loads_toml_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, AppConfig::example_toml()).unwrap();

        let loader = ConfigLoader::with_path(&path);
        let config = loader.load().unwrap();
        assert_eq!(config.pipeline.retry.max_attempts, 8);
    }
}
