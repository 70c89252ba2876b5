//! Core traits and session-level types.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Endpoint;
use crate::error::TransportError;
use crate::message::{ClientFrame, HostFrame};

/// Session identifier.
pub type SessionId = Uuid;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No transport; calls fail with a disconnection error.
    Disconnected,
    /// `start` is establishing the transport.
    Connecting,
    /// Transport is up and requests flow.
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Lifecycle notification broadcast by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { host_version: String },
    Disconnected { reason: String },
}

/// A message-delimited, order-preserving link to one host.
///
/// The inbound side yielding `None` is the disconnect notification.
#[derive(Debug)]
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<HostFrame>,
}

/// Trait for ways of reaching a host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel to the host at `endpoint`.
    ///
    /// The caller applies its own timeout.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TransportError>;
}
