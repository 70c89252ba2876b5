//! Core abstractions for driving an out-of-process language engine host.
//!
//! This crate provides the fundamental building blocks:
//! - Wire frames exchanged with the host
//! - `Transport` trait and `Channel`
//! - `CancelScope` for caller-supplied cancellation and deadlines
//! - `HostError` taxonomy and `EvaluationResult`
//! - Per-call output delivery
//! - Session configuration

pub mod cancel;
pub mod config;
pub mod error;
pub mod message;
pub mod output;
pub mod result;
pub mod traits;

pub use cancel::CancelScope;
pub use config::{Endpoint, SessionConfig};
pub use error::{HostError, HostResult, TransportError};
pub use message::{ClientFrame, HostFrame, HostReply, HostRequest, RemoteErrorKind, RequestId};
pub use output::{OutputCapture, OutputKind, OutputMsg, OutputSink, OutputStream, output_channel};
pub use result::{DataTable, ErrorCategory, EvaluationResult, ResultKind};
pub use traits::{Channel, SessionEvent, SessionId, SessionState, Transport};
