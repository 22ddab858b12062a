use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Peer not found: {0}")]
    NotFound(String),

    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Media link error: {0}")]
    Link(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("{message}")]
    Rpc {
        message: String,
        details: Option<String>,
    },

    #[error("Signaling transport closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Link(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Transport(format!("Invalid signaling URL: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
