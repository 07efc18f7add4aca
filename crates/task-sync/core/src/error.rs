//! Frame decoding errors.

use thiserror::Error;

/// Errors raised while decoding or encoding socket frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid streaming fragment: {0}")]
    Fragment(String),
}

/// Frame result type.
pub type Result<T> = std::result::Result<T, FrameError>;
