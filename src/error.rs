//! Error types for the transaction monitor

use thiserror::Error;

/// Main error type for the monitor
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Event server at {url} asked not to reconnect")]
    StreamClosed { url: String },

    #[error("Malformed payload from {source_name}: {message}")]
    MalformedPayload { source_name: String, message: String },

    #[error("Channel {channel} not found")]
    ChannelNotFound { channel: String },

    #[error("Participant {id} not found")]
    ParticipantNotFound { id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    /// Check if the failed operation may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, MonitorError::Transport { .. } | MonitorError::Http(_))
    }

    pub(crate) fn malformed(source_name: &str, message: impl Into<String>) -> Self {
        MonitorError::MalformedPayload {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for monitor operations
pub type MonitorResult<T> = Result<T, MonitorError>;
