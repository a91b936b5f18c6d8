//! Error types for pglogical-reader.
//!
//! Everything fallible in this crate returns [`ReaderError`]. The variants
//! split along what a caller can do about them:
//! - [`ReaderError::Connection`] is transient; the engine reconnects on it.
//! - [`ReaderError::Slot`] and [`ReaderError::Auth`] need operator action.
//! - [`ReaderError::MalformedFrame`] ends the session; nothing is salvaged.
//! - [`ReaderError::StreamTerminated`] is final: retries were exhausted or
//!   disabled.

use thiserror::Error;

/// Error type for all pglogical-reader operations.
#[derive(Debug, Error, Clone)]
pub enum ReaderError {
    /// Network failure, closed socket, connect timeout.
    ///
    /// `std::io::Error` is not `Clone`, so the message is stored.
    #[error("connection error: {0}")]
    Connection(String),

    /// Wrong credentials or an authentication method we cannot speak.
    #[error("authentication error: {0}")]
    Auth(String),

    /// TLS negotiation or certificate failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// The replication slot is missing, busy, or uses another output plugin.
    #[error("slot error: {0}")]
    Slot(String),

    /// A frame violated the replication protocol.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// ErrorResponse from the server that is not a slot problem.
    #[error("server error: {0}")]
    Server(String),

    /// Stream ended and will not be resumed.
    #[error("stream terminated: {0}")]
    StreamTerminated(String),

    /// The application callback failed; the event was not acknowledged.
    #[error("event handler failed: {0}")]
    Callback(String),

    /// Bug in this crate or misuse of the engine state machine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReaderError {
    #[inline]
    pub fn is_connection(&self) -> bool {
        matches!(self, ReaderError::Connection(_))
    }

    #[inline]
    pub fn is_slot(&self) -> bool {
        matches!(self, ReaderError::Slot(_))
    }

    #[inline]
    pub fn is_malformed(&self) -> bool {
        matches!(self, ReaderError::MalformedFrame(_))
    }

    /// Returns `true` if reconnecting could plausibly fix this error.
    ///
    /// Only connection errors qualify. Slot, auth and protocol errors recur
    /// on every attempt until configuration changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReaderError::Connection(_))
    }
}

impl From<std::io::Error> for ReaderError {
    fn from(err: std::io::Error) -> Self {
        ReaderError::Connection(err.to_string())
    }
}

/// Result type alias for pglogical-reader operations.
pub type Result<T> = std::result::Result<T, ReaderError>;
