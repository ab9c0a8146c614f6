//! Error types for gTunnel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Envelope or payload could not be decoded.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Encoded envelope exceeds the tunnel's frame limit.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The envelope decoded, but its tag names no payload this side understands.
    #[error("Unsupported message type: {0}")]
    UnsupportedMessageType(i64),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Prefix already in use: {0}")]
    PrefixConflict(String),

    #[error("Timeout")]
    Timeout,

    #[error("No tunnel for prefix: {0}")]
    NoRoute(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedMessage(err.to_string())
    }
}
