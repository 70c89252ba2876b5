//! Session orchestration for language hosts.
//!
//! Provides:
//! - `Session`: lifecycle state machine owning one transport connection
//! - `Correlator`: request/reply matching with a FIFO foreground gate
//! - `Evaluator`: execute, evaluate, invoke and plot operations

pub mod correlator;
pub mod eval;
pub mod session;

pub use correlator::Correlator;
pub use eval::{Evaluator, HostInfo};
pub use session::Session;
