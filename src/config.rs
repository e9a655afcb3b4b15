//! Configuration management for the telemetry pipeline

use crate::consent::ConsentConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Live configuration shared between the facade, the dispatcher and the scheduler.
pub type SharedConfig = Arc<RwLock<PipelineConfig>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Application identifier sent with every event
    pub app_id: String,

    /// Application version sent with every event
    pub app_version: String,

    /// Deployment environment (production, staging, ...)
    pub environment: String,

    /// Collector endpoint used when no bearer token is available
    pub public_endpoint: String,

    /// Collector endpoint used with a bearer token
    pub authenticated_endpoint: String,

    /// Remote time authority used to correct the local clock
    pub time_authority_url: Option<String>,

    /// Period of the batch submission timer
    pub batch_interval: Duration,

    /// Period of the dropped-event self report
    pub monitoring_interval: Duration,

    /// HTTP timeout for collector requests
    pub http_timeout: Duration,

    /// Consent categories that must not be collected
    pub blocked_consent_categories: ConsentConfig,

    /// Fail loudly on malformed events
    pub strict_mode: bool,

    /// Maximum number of queued events
    pub max_queue_len: usize,

    /// Directory of the durable event store
    pub store_dir: PathBuf,

    /// Extra attempts for a failed durable write
    pub persist_retries: u32,

    /// Base backoff between durable write attempts
    pub persist_retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            app_id: "unknown-app".to_string(),
            app_version: "0.0.0".to_string(),
            environment: "production".to_string(),
            public_endpoint: "http://localhost:9324/events/public".to_string(),
            authenticated_endpoint: "http://localhost:9324/events".to_string(),
            time_authority_url: None,
            batch_interval: Duration::from_secs(30),
            monitoring_interval: Duration::from_secs(60),
            http_timeout: Duration::from_secs(10),
            blocked_consent_categories: ConsentConfig::default(),
            strict_mode: cfg!(debug_assertions),
            max_queue_len: 10_000,
            store_dir: PathBuf::from(".telemetry"),
            persist_retries: 0,
            persist_retry_backoff_ms: 250,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = PipelineConfig::default();

        if let Ok(app_id) = env::var("TELEMETRY_APP_ID") {
            config.app_id = app_id;
        }

        if let Ok(app_version) = env::var("TELEMETRY_APP_VERSION") {
            config.app_version = app_version;
        }

        if let Ok(environment) = env::var("TELEMETRY_ENVIRONMENT") {
            config.environment = environment;
        }

        if let Ok(endpoint) = env::var("TELEMETRY_PUBLIC_ENDPOINT") {
            config.public_endpoint = endpoint;
        }

        if let Ok(endpoint) = env::var("TELEMETRY_AUTH_ENDPOINT") {
            config.authenticated_endpoint = endpoint;
        }

        if let Ok(url) = env::var("TELEMETRY_TIME_URL") {
            if !url.trim().is_empty() {
                config.time_authority_url = Some(url);
            }
        }

        if let Ok(interval) = env::var("TELEMETRY_BATCH_INTERVAL_SECONDS") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.batch_interval = Duration::from_secs(seconds);
            }
        }

        if let Ok(interval) = env::var("TELEMETRY_MONITORING_INTERVAL_SECONDS") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.monitoring_interval = Duration::from_secs(seconds);
            }
        }

        if let Ok(timeout) = env::var("TELEMETRY_HTTP_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.http_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(blocked) = env::var("TELEMETRY_BLOCKED_CATEGORIES") {
            config.blocked_consent_categories = ConsentConfig::from_blocked_list(&blocked);
        }

        if let Ok(strict) = env::var("TELEMETRY_STRICT_MODE") {
            config.strict_mode = strict.to_lowercase() == "true";
        }

        if let Ok(max_len) = env::var("TELEMETRY_MAX_QUEUE_LEN") {
            if let Ok(len) = max_len.parse() {
                config.max_queue_len = len;
            }
        }

        if let Ok(dir) = env::var("TELEMETRY_STORE_DIR") {
            config.store_dir = PathBuf::from(dir);
        }

        if let Ok(retries) = env::var("TELEMETRY_PERSIST_RETRIES") {
            if let Ok(retries) = retries.parse() {
                config.persist_retries = retries;
            }
        }

        if let Ok(backoff) = env::var("TELEMETRY_PERSIST_RETRY_BACKOFF_MS") {
            if let Ok(ms) = backoff.parse() {
                config.persist_retry_backoff_ms = ms;
            }
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.app_id.is_empty() {
            return Err("app_id cannot be empty".to_string());
        }

        if self.public_endpoint.is_empty() {
            return Err("public_endpoint cannot be empty".to_string());
        }

        if self.authenticated_endpoint.is_empty() {
            return Err("authenticated_endpoint cannot be empty".to_string());
        }

        if self.batch_interval.is_zero() {
            return Err("batch_interval must be greater than 0".to_string());
        }

        if self.monitoring_interval.is_zero() {
            return Err("monitoring_interval must be greater than 0".to_string());
        }

        if self.max_queue_len == 0 {
            return Err("max_queue_len must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}
