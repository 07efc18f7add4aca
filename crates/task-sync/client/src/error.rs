//! Client error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("subscription channel closed")]
    ChannelClosed,

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("reconnect attempts exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("conversation request failed: {0}")]
    Request(String),

    #[error("conversation http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("conversation decode failed: {0}")]
    Decode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
