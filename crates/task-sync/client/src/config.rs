//! Sync configuration loaded from `TASK_SYNC_*` environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Socket path joined onto the API origin when no socket URL is configured.
pub const DEFAULT_SOCKET_PATH: &str = "/api/v1/ws";
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_COMPLETION_EXPIRY_MS: u64 = 1_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid TASK_SYNC_WS_URL: {0}")]
    InvalidWsUrl(String),
    #[error("invalid TASK_SYNC_API_BASE_URL: {0}")]
    InvalidApiBaseUrl(String),
    #[error("invalid TASK_SYNC_RECONNECT_INTERVAL_MS: {0}")]
    InvalidReconnectIntervalMs(String),
    #[error("invalid TASK_SYNC_MAX_RECONNECT_ATTEMPTS: {0}")]
    InvalidMaxReconnectAttempts(String),
    #[error("invalid TASK_SYNC_HEARTBEAT_INTERVAL_MS: {0}")]
    InvalidHeartbeatIntervalMs(String),
    #[error("invalid TASK_SYNC_COMPLETION_EXPIRY_MS: {0}")]
    InvalidCompletionExpiryMs(String),
    #[error("invalid TASK_SYNC_CONNECT_TIMEOUT_MS: {0}")]
    InvalidConnectTimeoutMs(String),
    #[error("invalid TASK_SYNC_REQUEST_TIMEOUT_MS: {0}")]
    InvalidRequestTimeoutMs(String),
    #[error("invalid TASK_SYNC_REQUEST_ATTEMPTS: {0}")]
    InvalidRequestAttempts(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Explicit socket URL. Absolute `ws`/`wss` URLs are used as-is; a path
    /// starting with `/` is resolved against `api_base_url`.
    pub ws_url: Option<String>,
    pub api_base_url: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub completion_expiry: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub request_attempts: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            completion_expiry: Duration::from_millis(DEFAULT_COMPLETION_EXPIRY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let ws_url = read("TASK_SYNC_WS_URL");
        let api_base_url =
            read("TASK_SYNC_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let reconnect_interval_ms = read("TASK_SYNC_RECONNECT_INTERVAL_MS")
            .unwrap_or_else(|| DEFAULT_RECONNECT_INTERVAL_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidReconnectIntervalMs(error.to_string()))?;
        let max_reconnect_attempts = read("TASK_SYNC_MAX_RECONNECT_ATTEMPTS")
            .unwrap_or_else(|| DEFAULT_MAX_RECONNECT_ATTEMPTS.to_string())
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidMaxReconnectAttempts(error.to_string()))?;
        let heartbeat_interval_ms = read("TASK_SYNC_HEARTBEAT_INTERVAL_MS")
            .unwrap_or_else(|| DEFAULT_HEARTBEAT_INTERVAL_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidHeartbeatIntervalMs(error.to_string()))?;
        let completion_expiry_ms = read("TASK_SYNC_COMPLETION_EXPIRY_MS")
            .unwrap_or_else(|| DEFAULT_COMPLETION_EXPIRY_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidCompletionExpiryMs(error.to_string()))?;
        let connect_timeout_ms = read("TASK_SYNC_CONNECT_TIMEOUT_MS")
            .unwrap_or_else(|| DEFAULT_CONNECT_TIMEOUT_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidConnectTimeoutMs(error.to_string()))?;
        let request_timeout_ms = read("TASK_SYNC_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|| DEFAULT_REQUEST_TIMEOUT_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRequestTimeoutMs(error.to_string()))?;
        let request_attempts = read("TASK_SYNC_REQUEST_ATTEMPTS")
            .unwrap_or_else(|| DEFAULT_REQUEST_ATTEMPTS.to_string())
            .parse::<usize>()
            .map_err(|error| ConfigError::InvalidRequestAttempts(error.to_string()))?;

        let config = Self {
            ws_url,
            api_base_url,
            reconnect_interval: Duration::from_millis(reconnect_interval_ms),
            max_reconnect_attempts,
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            completion_expiry: Duration::from_millis(completion_expiry_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            request_timeout: Duration::from_millis(request_timeout_ms),
            request_attempts,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidHeartbeatIntervalMs(
                "must be greater than zero".to_string(),
            ));
        }
        if self.request_attempts == 0 {
            return Err(ConfigError::InvalidRequestAttempts(
                "must be at least 1".to_string(),
            ));
        }
        self.api_base()?;
        self.socket_url()?;
        Ok(())
    }

    /// API origin with any trailing slash removed.
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        let trimmed = self.api_base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidApiBaseUrl("missing".to_string()));
        }
        let url =
            Url::parse(trimmed).map_err(|error| ConfigError::InvalidApiBaseUrl(error.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidApiBaseUrl(format!(
                "URL must use http:// or https:// scheme, got: {}",
                url.scheme()
            )));
        }
        Ok(url)
    }

    /// Resolve the socket endpoint, falling back to the same-origin path.
    pub fn socket_url(&self) -> Result<Url, ConfigError> {
        match self.ws_url.as_deref().map(str::trim) {
            Some(path) if path.starts_with('/') => self.same_origin_socket(path),
            Some(url) => {
                let parsed =
                    Url::parse(url).map_err(|error| ConfigError::InvalidWsUrl(error.to_string()))?;
                if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                    return Err(ConfigError::InvalidWsUrl(format!(
                        "URL must use ws:// or wss:// scheme, got: {}",
                        parsed.scheme()
                    )));
                }
                Ok(parsed)
            }
            None => self.same_origin_socket(DEFAULT_SOCKET_PATH),
        }
    }

    fn same_origin_socket(&self, path: &str) -> Result<Url, ConfigError> {
        let mut url = self
            .api_base()?
            .join(path)
            .map_err(|error| ConfigError::InvalidWsUrl(error.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|()| {
            ConfigError::InvalidWsUrl(format!("cannot derive {scheme} URL from {url}"))
        })?;
        Ok(url)
    }
}
