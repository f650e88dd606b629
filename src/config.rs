use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::logic::snapshot::DEFAULT_SERVER_FIELDS;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub history: HistoryConfig,
}

/// Development entity store server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// First id the in-memory store hands out
    pub first_id: i64,
}

/// Remote entity store the command log talks to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub base_url: Option<String>,
    /// Sent as `X-CSRFToken` on every call
    pub csrf_token: Option<String>,
    /// Sent as the `Cookie` header on every call
    pub session_cookie: Option<String>,
    pub timeout_ms: u64,
}

/// Bounded exponential backoff for transient store failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Oldest commands are evicted beyond this many; 0 keeps everything
    pub max_entries: usize,
    /// Fields stripped from a deleted entity's snapshot before re-creation
    pub server_fields: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            first_id: 1,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            csrf_token: None,
            session_cookie: None,
            timeout_ms: 10_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 0,
            server_fields: DEFAULT_SERVER_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and config file
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name("config").required(false));

        // Environment variables such as ANNOTATION_STORE__BASE_URL
        config = config.add_source(
            config::Environment::with_prefix("ANNOTATION")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("history.server_fields")
                .try_parsing(true),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }

    /// Base URL of the entity store, falling back to the development server
    pub fn store_base_url(&self) -> String {
        if let Some(base_url) = &self.store.base_url {
            return base_url.clone();
        }
        format!("http://{}", self.server_address())
    }

    /// Get the server bind address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
