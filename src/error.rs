use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the chat engine.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The user stopped the stream. Not a failure.
    #[error("request cancelled")]
    Cancelled,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("no data received for {0:?}")]
    Timeout(Duration),

    #[error("server responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("server error: {0}")]
    Server(String),

    #[error("failed to serialize request: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to decode stream line {line:?}: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stream line is not valid UTF-8")]
    InvalidUtf8,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("message {0} not found")]
    MessageNotFound(Uuid),

    #[error("message cannot be retried: {0}")]
    NotRetryable(String),

    #[error("revision navigation is not available")]
    NavigationUnavailable,
}

impl ChatError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }

    /// True for per-line failures that must not abort the stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChatError::Decode { .. } | ChatError::InvalidUtf8)
    }
}
