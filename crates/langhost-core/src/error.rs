//! Error taxonomy shared by every layer of the client engine.

use std::time::Duration;

use thiserror::Error;

use crate::message::RemoteErrorKind;

/// Convenience alias used throughout the engine.
pub type HostResult<T> = Result<T, HostError>;

/// Transport-level failure while connecting or exchanging frames.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("Host executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Unsupported endpoint for this transport: {0}")]
    Unsupported(String),
    #[error("Channel closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of the session, blob and evaluation APIs.
///
/// Cancellation, disconnection and not-found are ordinary variants so that
/// callers branch on them with `match` instead of inspecting messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// The caller's scope was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller's deadline expired. Behaves like [`HostError::Cancelled`].
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The transport to the host was lost, or the session is not running.
    #[error("Disconnected from host: {reason}")]
    Disconnected { reason: String },

    /// The submitted code failed on the host.
    #[error("Evaluation failed: {message}")]
    Evaluation { message: String },

    /// The referenced host object does not exist (destroyed, unknown, or
    /// issued by a previous connection).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A range argument lies outside the addressed object.
    #[error("Offset {offset} out of range for length {length}")]
    OutOfRange { offset: u64, length: u64 },

    /// The host rejected the request or answered with an unexpected reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A value could not be converted to the requested shape.
    #[error("Format error: {0}")]
    Format(String),

    /// `start` was called on a session that is not disconnected.
    #[error("Session already running")]
    AlreadyRunning,

    /// The object was closed and accepts no further operations.
    #[error("Object is closed")]
    Closed,

    /// Establishing the transport failed.
    #[error("Connection failed: {0}")]
    Connection(#[from] TransportError),
}

impl HostError {
    /// Build a disconnection error.
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// True for caller-initiated cancellation and deadline expiry alike.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }

    /// True when the session lost its host.
    #[must_use]
    pub const fn is_disconnection(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }

    /// True when the addressed host object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Map an error reply from the host onto the taxonomy.
    #[must_use]
    pub fn from_remote(kind: RemoteErrorKind, message: String) -> Self {
        match kind {
            RemoteErrorKind::NotFound => Self::NotFound(message),
            RemoteErrorKind::OutOfRange { offset, length } => Self::OutOfRange { offset, length },
            RemoteErrorKind::InvalidArgument | RemoteErrorKind::Internal => Self::Protocol(message),
        }
    }
}
