//! Transports for reaching a language host.
//!
//! Provides:
//! - Line-delimited JSON framing over TCP and Unix sockets
//! - Child-process hosts over stdio (feature: process)
//! - A scripted in-memory host (feature: memory)

pub mod stream;

#[cfg(feature = "process")]
pub mod process;

#[cfg(feature = "memory")]
pub mod memory;

pub use stream::{LineTasks, StreamTransport, line_channel};

#[cfg(feature = "process")]
pub use process::{HostCommand, ProcessTransport};

#[cfg(feature = "memory")]
pub use memory::{HostController, MemoryTransport};
