//! Error types for the bridge.

use std::sync::{mpsc, Arc};

use thiserror::Error;

/// Result type returned by fallible bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the bridge.
///
/// Transport workers never return these directly to their owner. Instead they
/// report the human-readable rendering through their event stream, at most
/// once per connected session.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// I/O error reported by the operating system.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Transport failed to open, bind, read or write.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation requires a connected endpoint.
    #[error("link is not connected")]
    NotConnected,

    /// Caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The codec rejected a byte sequence. Dropped silently by the frame
    /// pipeline; never surfaced to the operator.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Invalid host string, duplicate peer, unknown link type on load.
    #[error("configuration error: {0}")]
    Config(String),

    /// All parser channels are in use; link creation must fail.
    #[error("parser channels exhausted")]
    Allocation,

    /// An internal queue was closed while the other end was still talking.
    #[error("channel closed: {0}")]
    Closed(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<mavio::error::Error> for Error {
    fn from(value: mavio::error::Error) -> Self {
        match value {
            mavio::error::Error::Io(err) => Error::Io(err),
            err => Error::Frame(err.to_string()),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(value: serialport::Error) -> Self {
        Error::Transport(value.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(value: toml::de::Error) -> Self {
        Error::Config(value.to_string())
    }
}

impl<T> From<mpsc::SendError<T>> for Error {
    fn from(value: mpsc::SendError<T>) -> Self {
        Error::Closed(value.to_string())
    }
}

impl From<mpsc::RecvError> for Error {
    fn from(value: mpsc::RecvError) -> Self {
        Error::Closed(value.to_string())
    }
}

impl From<mpsc::RecvTimeoutError> for Error {
    fn from(value: mpsc::RecvTimeoutError) -> Self {
        Error::Closed(value.to_string())
    }
}
