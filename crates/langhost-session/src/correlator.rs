//! Request correlation over one host connection.
//!
//! Every request gets a fresh id and its own completion slot, so a reply
//! can only ever reach the caller that issued it. Foreground requests
//! additionally hold the single permit of a fair semaphore until the host
//! has finished with them, which serializes them in submission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use langhost_core::{
    CancelScope, Channel, ClientFrame, HostError, HostFrame, HostReply, HostRequest, HostResult,
    OutputMsg, OutputSink, RequestId,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

type ReplySlot = oneshot::Sender<HostResult<HostReply>>;

/// Outstanding request awaiting its reply.
struct Pending {
    op: &'static str,
    reply: ReplySlot,
    output: Option<OutputSink>,
}

struct Inner {
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    pending: Mutex<HashMap<RequestId, Pending>>,
    interrupts: Mutex<Vec<oneshot::Sender<()>>>,
    next_id: AtomicU64,
    gate: Arc<Semaphore>,
    grace: Duration,
    closing: AtomicBool,
    failure: Mutex<Option<String>>,
    dead: CancellationToken,
    span: Span,
}

/// Correlates requests and replies on a single connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    /// Take over `channel` and start dispatching its frames.
    ///
    /// `on_close` runs once, with the reason, after the connection is gone
    /// and every pending request has been failed.
    pub fn spawn<F>(channel: Channel, grace: Duration, span: Span, on_close: F) -> Self
    where
        F: FnOnce(String) + Send + 'static,
    {
        let Channel { outbound, inbound } = channel;
        let inner = Arc::new(Inner {
            outbound: Mutex::new(Some(outbound)),
            pending: Mutex::new(HashMap::new()),
            interrupts: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            gate: Arc::new(Semaphore::new(1)),
            grace,
            closing: AtomicBool::new(false),
            failure: Mutex::new(None),
            dead: CancellationToken::new(),
            span: span.clone(),
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(
            async move {
                let reason = reader.read_loop(inbound).await;
                reader.fail(&reason);
                on_close(reader.failure_reason());
            }
            .instrument(span),
        );

        Self { inner }
    }

    /// True until the connection is lost or closed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.inner.dead.is_cancelled()
    }

    /// Why the connection ended, once it has.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        lock(&self.inner.failure).clone()
    }

    /// Send `request` and wait for its reply.
    ///
    /// Foreground requests first wait their turn behind earlier foreground
    /// requests. If `scope` fires first, the host is asked to abort, the
    /// caller gets the scope's error straight away, and the foreground
    /// turn is only released once the host confirms the abort. A host that
    /// stays silent past the grace period loses the connection.
    ///
    /// # Errors
    /// Returns the scope's cancellation error, or a disconnection error if
    /// the connection is or becomes unusable.
    pub async fn submit(
        &self,
        request: HostRequest,
        scope: &CancelScope,
        output: Option<OutputSink>,
    ) -> HostResult<HostReply> {
        self.ensure_alive()?;
        if scope.is_cancelled() {
            return Err(scope.error());
        }

        let op = request.name();
        let permit = if request.is_foreground() {
            Some(self.acquire_turn(scope).await?)
        } else {
            None
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.inner.register(
            id,
            Pending {
                op,
                reply: tx,
                output,
            },
        )?;
        self.inner.send(ClientFrame::Request { id, request })?;
        tracing::trace!(request = id, op, "Sent request");

        tokio::select! {
            biased;
            reply = &mut rx => {
                drop(permit);
                reply.unwrap_or_else(|_| Err(self.inner.disconnection()))
            }
            () = scope.cancelled() => {
                let err = scope.error();
                match &err {
                    HostError::Timeout(after) => {
                        tracing::info!(request = id, op, ?after, "Request deadline expired");
                    }
                    _ => tracing::debug!(request = id, op, "Request cancelled"),
                }
                self.abandon(id, rx, permit);
                Err(err)
            }
        }
    }

    /// Send `request` without waiting for a reply.
    ///
    /// # Errors
    /// Returns a disconnection error if the connection is gone.
    pub fn post(&self, request: HostRequest) -> HostResult<()> {
        self.ensure_alive()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.send(ClientFrame::Request { id, request })
    }

    /// Interrupt whatever foreground work the host is running.
    ///
    /// Goes out immediately, ahead of any queued foreground request.
    ///
    /// # Errors
    /// Returns [`HostError::Timeout`] if the host does not acknowledge in
    /// time, or a disconnection error.
    pub async fn interrupt(&self, timeout: Duration) -> HostResult<()> {
        self.ensure_alive()?;
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.interrupts).push(tx);
        self.inner.send(ClientFrame::Cancel { target: None })?;
        tracing::debug!("Sent interrupt");

        let acked = tokio::time::timeout(timeout, rx).await;
        match acked {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.inner.disconnection()),
            Err(_) => {
                // Our receiver is gone; drop every waiter nobody listens to.
                lock(&self.inner.interrupts).retain(|waiter| !waiter.is_closed());
                Err(HostError::Timeout(timeout))
            }
        }
    }

    #[cfg(test)]
    fn interrupt_waiters(&self) -> usize {
        lock(&self.inner.interrupts).len()
    }

    /// Mark the connection as shutting down and ask the host to exit.
    ///
    /// # Errors
    /// Returns a disconnection error if the connection is already gone.
    pub fn shutdown(&self) -> HostResult<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.post(HostRequest::Shutdown)
    }

    /// Drop the connection and fail every pending request with `reason`.
    pub fn close(&self, reason: &str) {
        self.inner.fail(reason);
    }

    fn ensure_alive(&self) -> HostResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(self.inner.disconnection())
        }
    }

    async fn acquire_turn(&self, scope: &CancelScope) -> HostResult<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.inner.gate).acquire_owned() => {
                permit.map_err(|_| self.inner.disconnection())
            }
            () = scope.cancelled() => Err(scope.error()),
        }
    }

    /// Hand a cancelled request over to a watchdog.
    ///
    /// The request stays registered so its late reply is consumed here
    /// and never delivered to anybody else.
    fn abandon(
        &self,
        id: RequestId,
        rx: oneshot::Receiver<HostResult<HostReply>>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if let Some(pending) = lock(&self.inner.pending).get_mut(&id) {
            pending.output = None;
        }
        if self
            .inner
            .send(ClientFrame::Cancel { target: Some(id) })
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            async move {
                match tokio::time::timeout(inner.grace, rx).await {
                    Ok(Ok(reply)) => {
                        tracing::debug!(
                            request = id,
                            ok = reply.is_ok(),
                            "Host finished cancelled request"
                        );
                    }
                    Ok(Err(_)) => {}
                    Err(_) => {
                        tracing::warn!(
                            request = id,
                            grace = ?inner.grace,
                            "Host did not confirm cancellation"
                        );
                        inner.fail("host did not confirm cancellation");
                    }
                }
                drop(permit);
            }
            .instrument(self.inner.span.clone()),
        );
    }
}

impl Inner {
    /// Returns the reason the loop ended.
    async fn read_loop(&self, mut inbound: mpsc::UnboundedReceiver<HostFrame>) -> String {
        loop {
            tokio::select! {
                () = self.dead.cancelled() => return self.failure_reason(),
                frame = inbound.recv() => match frame {
                    Some(frame) => self.dispatch(frame),
                    None if self.closing.load(Ordering::SeqCst) => {
                        tracing::info!("Host shut down");
                        return "host shut down".to_string();
                    }
                    None => {
                        tracing::warn!("Host closed the connection");
                        return "host closed the connection".to_string();
                    }
                },
            }
        }
    }

    fn dispatch(&self, frame: HostFrame) {
        match frame {
            HostFrame::Reply { id, reply } => {
                let Some(pending) = lock(&self.pending).remove(&id) else {
                    tracing::debug!(request = id, "Dropping reply for unknown request");
                    return;
                };
                tracing::trace!(request = id, op = pending.op, "Received reply");
                let _ = pending.reply.send(Ok(reply));
            }
            HostFrame::Output { id, kind, text } => {
                let pending = lock(&self.pending);
                let sink = id
                    .and_then(|id| pending.get(&id))
                    .and_then(|p| p.output.as_ref());
                let msg = OutputMsg { kind, text };
                match sink {
                    Some(sink) => {
                        sink.send(msg);
                    }
                    None => tracing::debug!(
                        request = ?id,
                        kind = ?msg.kind,
                        "{}",
                        msg.text.trim_end()
                    ),
                }
            }
            HostFrame::CancelAck { target: None } => {
                for waiter in lock(&self.interrupts).drain(..) {
                    let _ = waiter.send(());
                }
            }
            HostFrame::CancelAck { target: Some(id) } => {
                tracing::trace!(request = id, "Host acknowledged cancel");
            }
        }
    }

    fn register(&self, id: RequestId, pending: Pending) -> HostResult<()> {
        let mut map = lock(&self.pending);
        if lock(&self.failure).is_some() {
            return Err(self.disconnection());
        }
        map.insert(id, pending);
        Ok(())
    }

    fn send(&self, frame: ClientFrame) -> HostResult<()> {
        let sent = lock(&self.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());
        if sent {
            Ok(())
        } else {
            self.fail("transport closed");
            Err(self.disconnection())
        }
    }

    /// Returns false if the connection had already failed.
    fn fail(&self, reason: &str) -> bool {
        {
            let mut failure = lock(&self.failure);
            if failure.is_some() {
                return false;
            }
            *failure = Some(reason.to_string());
        }
        lock(&self.outbound).take();
        self.gate.close();
        self.dead.cancel();

        let pending: Vec<_> = lock(&self.pending).drain().collect();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), reason, "Failing pending requests");
        }
        for (_, pending) in pending {
            let _ = pending.reply.send(Err(HostError::disconnected(reason)));
        }
        lock(&self.interrupts).clear();
        true
    }

    fn failure_reason(&self) -> String {
        lock(&self.failure)
            .clone()
            .unwrap_or_else(|| "connection closed".to_string())
    }

    fn disconnection(&self) -> HostError {
        HostError::disconnected(self.failure_reason())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use langhost_core::{OutputKind, ResultKind, output_channel};
    use serde_json::json;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    use super::*;

    struct Wire {
        requests: UnboundedReceiver<ClientFrame>,
        replies: UnboundedSender<HostFrame>,
    }

    impl Wire {
        async fn next(&mut self) -> ClientFrame {
            self.requests.recv().await.expect("client hung up")
        }

        async fn next_request(&mut self) -> RequestId {
            match self.next().await {
                ClientFrame::Request { id, .. } => id,
                other => panic!("Expected request, got {other:?}"),
            }
        }

        fn reply(&self, id: RequestId, reply: HostReply) {
            self.replies.send(HostFrame::Reply { id, reply }).unwrap();
        }
    }

    fn connect(grace: Duration) -> (Correlator, Wire, oneshot::Receiver<String>) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let correlator = Correlator::spawn(
            Channel {
                outbound: client_tx,
                inbound: host_rx,
            },
            grace,
            Span::none(),
            move |reason| {
                let _ = closed_tx.send(reason);
            },
        );
        let wire = Wire {
            requests: client_rx,
            replies: host_tx,
        };
        (correlator, wire, closed_rx)
    }

    fn evaluate(expr: &str) -> HostRequest {
        HostRequest::Evaluate {
            expr: expr.to_string(),
            kind: ResultKind::Structured,
        }
    }

    #[tokio::test]
    async fn test_reply_reaches_caller() {
        let (correlator, mut wire, _closed) = connect(Duration::from_secs(1));
        let call = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.submit(evaluate("1+1"), &CancelScope::new(), None).await }
        });

        let id = wire.next_request().await;
        wire.reply(id, HostReply::Value { value: json!(2) });
        assert_eq!(call.await.unwrap().unwrap(), HostReply::Value { value: json!(2) });
    }

    #[tokio::test]
    async fn test_output_routed_to_call_sink() {
        let (correlator, mut wire, _closed) = connect(Duration::from_secs(1));
        let (sink, stream) = output_channel();
        let call = tokio::spawn({
            let correlator = correlator.clone();
            async move {
                correlator
                    .submit(evaluate("cat('hi')"), &CancelScope::new(), Some(sink))
                    .await
            }
        });

        let id = wire.next_request().await;
        wire.replies
            .send(HostFrame::Output {
                id: Some(id),
                kind: OutputKind::Normal,
                text: "hi".to_string(),
            })
            .unwrap();
        wire.replies
            .send(HostFrame::Output {
                id: None,
                kind: OutputKind::Error,
                text: "stray".to_string(),
            })
            .unwrap();
        wire.reply(id, HostReply::Value { value: json!(null) });
        call.await.unwrap().unwrap();

        let capture = langhost_core::OutputCapture::collect(stream).await;
        assert_eq!(capture.messages(), vec![OutputMsg::normal("hi")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_host_before_next_turn() {
        let (correlator, mut wire, _closed) = connect(Duration::from_secs(5));
        let scope = CancelScope::new();
        let first = tokio::spawn({
            let correlator = correlator.clone();
            let scope = scope.clone();
            async move { correlator.submit(evaluate("Sys.sleep(60)"), &scope, None).await }
        });
        let first_id = wire.next_request().await;

        scope.cancel();
        assert!(matches!(first.await.unwrap(), Err(HostError::Cancelled)));
        assert_eq!(
            wire.next().await,
            ClientFrame::Cancel {
                target: Some(first_id)
            }
        );

        let second = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.submit(evaluate("2"), &CancelScope::new(), None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(wire.requests.try_recv().is_err());

        // The stale reply is swallowed; the next request goes out afterwards.
        wire.reply(first_id, HostReply::Cancelled);
        let second_id = wire.next_request().await;
        wire.reply(second_id, HostReply::Value { value: json!(2) });
        assert_eq!(
            second.await.unwrap().unwrap(),
            HostReply::Value { value: json!(2) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_cancel_disconnects() {
        let (correlator, mut wire, closed) = connect(Duration::from_millis(500));
        let scope = CancelScope::with_timeout(Duration::from_millis(100));
        let result = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.submit(evaluate("Sys.sleep(60)"), &scope, None).await }
        });
        wire.next_request().await;
        assert!(matches!(result.await.unwrap(), Err(HostError::Timeout(_))));

        assert_eq!(closed.await.unwrap(), "host did not confirm cancellation");
        assert!(!correlator.is_alive());
        let err = correlator
            .submit(evaluate("1"), &CancelScope::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_disconnection());
    }

    #[tokio::test]
    async fn test_host_exit_fails_pending() {
        let (correlator, mut wire, closed) = connect(Duration::from_secs(1));
        let call = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.submit(evaluate("1"), &CancelScope::new(), None).await }
        });
        wire.next_request().await;
        drop(wire);

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_disconnection());
        assert_eq!(closed.await.unwrap(), "host closed the connection");
    }

    #[tokio::test]
    async fn test_interrupt_goes_ahead_of_queue() {
        let (correlator, mut wire, _closed) = connect(Duration::from_secs(1));
        let first = tokio::spawn({
            let correlator = correlator.clone();
            async move {
                let scope = CancelScope::new();
                correlator.submit(evaluate("Sys.sleep(60)"), &scope, None).await
            }
        });
        let first_id = wire.next_request().await;

        let interrupt = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.interrupt(Duration::from_secs(5)).await }
        });
        assert_eq!(wire.next().await, ClientFrame::Cancel { target: None });
        wire.reply(first_id, HostReply::Cancelled);
        wire.replies
            .send(HostFrame::CancelAck { target: None })
            .unwrap();

        interrupt.await.unwrap().unwrap();
        assert_eq!(first.await.unwrap().unwrap(), HostReply::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_interrupts_do_not_accumulate() {
        let (correlator, mut wire, _closed) = connect(Duration::from_secs(1));
        for _ in 0..3 {
            let err = correlator
                .interrupt(Duration::from_millis(100))
                .await
                .unwrap_err();
            assert!(matches!(err, HostError::Timeout(_)));
            assert_eq!(wire.next().await, ClientFrame::Cancel { target: None });
        }
        assert_eq!(correlator.interrupt_waiters(), 0);
        assert!(correlator.is_alive());
    }

    #[tokio::test]
    async fn test_failure_reason_is_recorded() {
        let (correlator, wire, closed) = connect(Duration::from_secs(1));
        assert_eq!(correlator.failure(), None);
        drop(wire);
        assert_eq!(closed.await.unwrap(), "host closed the connection");
        assert!(!correlator.is_alive());
        assert_eq!(
            correlator.failure().as_deref(),
            Some("host closed the connection")
        );
    }
}
