//! Per-call console output delivery.
//!
//! Each call that wants the host's console output registers its own
//! [`OutputSink`]. The sink is dropped when the call resolves, which ends
//! the matching [`OutputStream`], so output from a later call can never
//! reach an earlier subscriber.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Default capture limit (1 MiB).
const CAPTURE_BYTES: usize = 1024 * 1024;

/// Console stream a chunk of output was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Normal,
    Error,
}

/// One chunk of host console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMsg {
    pub kind: OutputKind,
    pub text: String,
}

impl OutputMsg {
    /// Normal output chunk.
    pub fn normal(text: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Normal,
            text: text.into(),
        }
    }

    /// Error output chunk.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Error,
            text: text.into(),
        }
    }
}

/// Sending half registered with a single call.
#[derive(Debug)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<OutputMsg>,
}

impl OutputSink {
    /// Deliver a chunk. Returns false once the stream side is gone.
    pub fn send(&self, msg: OutputMsg) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Receiving half; ends when the owning call resolves.
pub struct OutputStream {
    inner: UnboundedReceiverStream<OutputMsg>,
}

impl Stream for OutputStream {
    type Item = OutputMsg;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Create a sink/stream pair for one call.
#[must_use]
pub fn output_channel() -> (OutputSink, OutputStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        OutputSink { tx },
        OutputStream {
            inner: UnboundedReceiverStream::new(rx),
        },
    )
}

/// Bounded history of output chunks.
///
/// Oldest chunks are evicted once the byte limit is reached.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    history: VecDeque<OutputMsg>,
    total_bytes: usize,
    limit: usize,
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::with_limit(CAPTURE_BYTES)
    }
}

impl OutputCapture {
    /// Capture with a custom byte limit.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(32),
            total_bytes: 0,
            limit,
        }
    }

    /// Drain a stream to completion.
    pub async fn collect(mut stream: OutputStream) -> Self {
        let mut capture = Self::default();
        while let Some(msg) = stream.next().await {
            capture.push(msg);
        }
        capture
    }

    /// Append a chunk, evicting old ones past the limit.
    pub fn push(&mut self, msg: OutputMsg) {
        let bytes = msg.text.len();
        while self.total_bytes.saturating_add(bytes) > self.limit {
            if let Some(front) = self.history.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(front.text.len());
            } else {
                break;
            }
        }
        self.history.push_back(msg);
        self.total_bytes = self.total_bytes.saturating_add(bytes);
    }

    /// Concatenated text of one kind.
    #[must_use]
    pub fn text(&self, kind: OutputKind) -> String {
        self.history
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.text.as_str())
            .collect()
    }

    /// Snapshot of the retained chunks.
    #[must_use]
    pub fn messages(&self) -> Vec<OutputMsg> {
        self.history.iter().cloned().collect()
    }
}
