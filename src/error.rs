use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidUrl {
        url: String,
        reason: String,
    },

    #[error("Invalid handshake header {name}: {reason}")]
    InvalidHeader {
        name: &'static str,
        reason: String,
    },

    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Server returned Sec-WebSocket-Accept '{actual}', expected '{expected}'")]
    AcceptMismatch {
        expected: String,
        actual: String,
    },

    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("permessage-deflate negotiation or coding failed: {0}")]
    Extension(String),

    #[error("Message of {size} bytes exceeds the {max_size} byte limit")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Connection closed before the end of the response ({frames} frames received)")]
    StreamClosed {
        frames: usize,
    },

    #[error("Terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
