use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport is already connected")]
    AlreadyConnected,

    #[error("Transport is not connected")]
    NotConnected,

    #[error("No circuit owns channel {channel:?}")]
    NotFound { channel: String },

    #[error("Request {request_id} timed out after {ttl:?}")]
    Timeout { request_id: String, ttl: Duration },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// No known owner for `channel`
    pub fn not_found(channel: impl Into<String>) -> Self {
        Self::NotFound {
            channel: channel.into(),
        }
    }

    /// Whether the error came from the request deadline expiring
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
