//! In-memory transport backed by a scripted host.
//!
//! Useful for tests and for embedding without a real engine. Every
//! `connect` starts a fresh host with empty state, the same as a restarted
//! engine process.

mod host;
mod lang;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use langhost_core::{Channel, Endpoint, HostRequest, Transport, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use host::FakeHost;

const DEFAULT_VERSION: &str = "fake-host/1.0";

/// Shared switches and counters for the in-memory host.
#[derive(Debug, Default)]
pub(crate) struct HostControl {
    connections: AtomicUsize,
    refuse: AtomicBool,
    ignore_cancel: AtomicBool,
    ignore_shutdown: AtomicBool,
    connect_delay_ms: AtomicU64,
    blob_writes: AtomicUsize,
    version: Mutex<Option<String>>,
    requests: Mutex<Vec<String>>,
    foreground: Mutex<Vec<String>>,
    crash: Mutex<CancellationToken>,
}

impl HostControl {
    fn record(&self, name: &str) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(name.to_string());
        }
    }

    fn record_foreground(&self, request: &HostRequest) {
        let text = match request {
            HostRequest::Execute { code } => code.clone(),
            HostRequest::Evaluate { expr, .. } | HostRequest::Plot { expr, .. } => expr.clone(),
            HostRequest::Invoke { function, .. } => function.clone(),
            other => other.name().to_string(),
        };
        if let Ok(mut foreground) = self.foreground.lock() {
            foreground.push(text);
        }
    }

    fn record_blob_write(&self) {
        self.blob_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn ignores_cancel(&self) -> bool {
        self.ignore_cancel.load(Ordering::SeqCst)
    }

    fn ignores_shutdown(&self) -> bool {
        self.ignore_shutdown.load(Ordering::SeqCst)
    }

    fn version(&self) -> String {
        self.version
            .lock()
            .ok()
            .and_then(|v| v.clone())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string())
    }

    fn crash_token(&self) -> CancellationToken {
        self.crash
            .lock()
            .map(|token| token.clone())
            .unwrap_or_default()
    }
}

/// Transport connecting to an in-process scripted host.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    control: Arc<HostControl>,
}

impl MemoryTransport {
    /// Create a new in-memory transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for steering and observing the host.
    #[must_use]
    pub fn controller(&self) -> HostController {
        HostController {
            control: Arc::clone(&self.control),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        if *endpoint != Endpoint::Memory {
            return Err(TransportError::Unsupported(endpoint.to_string()));
        }

        let delay = self.control.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.control.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "in-memory host refused the connection",
            )));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        self.control.connections.fetch_add(1, Ordering::SeqCst);

        let host = FakeHost::new(Arc::clone(&self.control), host_tx);
        tokio::spawn(host.run(client_rx, self.control.crash_token()));

        Ok(Channel {
            outbound: client_tx,
            inbound: host_rx,
        })
    }
}

/// Steers the in-memory host from tests.
#[derive(Debug, Clone)]
pub struct HostController {
    control: Arc<HostControl>,
}

impl HostController {
    /// Drop every live connection as if the host process died.
    pub fn crash(&self) {
        if let Ok(mut token) = self.control.crash.lock() {
            token.cancel();
            *token = CancellationToken::new();
        }
    }

    /// Stop confirming cancel and interrupt requests.
    pub fn set_ignore_cancel(&self, ignore: bool) {
        self.control.ignore_cancel.store(ignore, Ordering::SeqCst);
    }

    /// Acknowledge shutdown requests but keep the connection open.
    pub fn set_ignore_shutdown(&self, ignore: bool) {
        self.control.ignore_shutdown.store(ignore, Ordering::SeqCst);
    }

    /// Make subsequent connects fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.control.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Delay subsequent connects.
    pub fn set_connect_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.control.connect_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Version string reported in the handshake.
    pub fn set_version(&self, version: impl Into<String>) {
        if let Ok(mut current) = self.control.version.lock() {
            *current = Some(version.into());
        }
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.control.connections.load(Ordering::SeqCst)
    }

    /// Number of blob write requests received.
    #[must_use]
    pub fn blob_writes(&self) -> usize {
        self.control.blob_writes.load(Ordering::SeqCst)
    }

    /// Names of all requests received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.control
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Code of foreground requests in the order the host started them.
    #[must_use]
    pub fn foreground(&self) -> Vec<String> {
        self.control
            .foreground
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use langhost_core::{ClientFrame, HostFrame, HostReply, ResultKind};
    use serde_json::json;

    use super::*;

    async fn request(channel: &mut Channel, id: u64, request: HostRequest) -> HostReply {
        channel
            .outbound
            .send(ClientFrame::Request { id, request })
            .unwrap();
        loop {
            match channel.inbound.recv().await.unwrap() {
                HostFrame::Reply { id: got, reply } if got == id => return reply,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_evaluate_and_blob_roundtrip() {
        let transport = MemoryTransport::new();
        let mut channel = transport.connect(&Endpoint::Memory).await.unwrap();

        let reply = request(
            &mut channel,
            1,
            HostRequest::Evaluate {
                expr: "1+1".to_string(),
                kind: ResultKind::Structured,
            },
        )
        .await;
        assert_eq!(reply, HostReply::Value { value: json!(2) });

        let reply = request(&mut channel, 2, HostRequest::BlobCreate { data: None }).await;
        let HostReply::BlobCreated { id } = reply else {
            panic!("Wrong reply: {reply:?}");
        };
        let reply = request(
            &mut channel,
            3,
            HostRequest::BlobWrite {
                id,
                offset: 0,
                data: b"abc".to_vec(),
            },
        )
        .await;
        assert_eq!(reply, HostReply::Ack);
        let reply = request(
            &mut channel,
            4,
            HostRequest::BlobRead {
                id,
                offset: 1,
                length: 10,
            },
        )
        .await;
        assert_eq!(
            reply,
            HostReply::BlobData {
                data: b"bc".to_vec()
            }
        );
        assert_eq!(transport.controller().blob_writes(), 1);
    }

    #[tokio::test]
    async fn test_crash_closes_channel() {
        let transport = MemoryTransport::new();
        let mut channel = transport.connect(&Endpoint::Memory).await.unwrap();
        transport.controller().crash();
        assert!(channel.inbound.recv().await.is_none());

        let mut second = transport.connect(&Endpoint::Memory).await.unwrap();
        let reply = request(&mut second, 1, HostRequest::Handshake).await;
        assert!(matches!(reply, HostReply::Handshake { .. }));
        assert_eq!(transport.controller().connections(), 2);
    }

    #[tokio::test]
    async fn test_rejects_other_endpoints() {
        let transport = MemoryTransport::new();
        let err = transport
            .connect(&Endpoint::Tcp {
                address: "127.0.0.1:1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }
}
