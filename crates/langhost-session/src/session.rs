//! Session lifecycle: one logical conversation with a host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use langhost_core::{
    CancelScope, HostError, HostReply, HostRequest, HostResult, OutputSink, SessionConfig,
    SessionEvent, SessionId, SessionState, Transport,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::correlator::Correlator;

const EVENT_CAPACITY: usize = 16;

/// Connection slot of a session.
enum Link {
    Idle,
    Connecting(CancellationToken),
    Running(Correlator),
}

struct Shared {
    id: SessionId,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    link: Mutex<Link>,
    epoch: AtomicU64,
    host_version: Mutex<Option<String>>,
    last_reason: Mutex<Option<String>>,
    span: Span,
}

/// Client-side handle for one host conversation.
///
/// A session moves `Disconnected → Connecting → Running → Disconnected`.
/// There is no automatic reconnect; after a disconnect the owner calls
/// [`Session::start`] again, which yields a fresh connection whose blob
/// ids and request ids share nothing with the previous one.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a disconnected session reaching its host through `transport`.
    #[must_use]
    pub fn new(config: SessionConfig, transport: impl Transport + 'static) -> Self {
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a session sharing an existing transport.
    #[must_use]
    pub fn with_transport(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!(
            "session",
            id = %id,
            name = %config.name,
            endpoint = %config.endpoint
        );
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                id,
                config,
                transport,
                state,
                events,
                link: Mutex::new(Link::Idle),
                epoch: AtomicU64::new(0),
                host_version: Mutex::new(None),
                last_reason: Mutex::new(None),
                span,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// True when the host is reached over a non-loopback network address.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.shared.config.endpoint.is_remote()
    }

    /// Version reported by the most recently connected host.
    #[must_use]
    pub fn host_version(&self) -> Option<String> {
        lock(&self.shared.host_version).clone()
    }

    /// Subscribe to connect/disconnect notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the session reaches `state`.
    ///
    /// # Errors
    /// Returns [`HostError::Timeout`] if `state` is not reached in time.
    pub async fn wait_for_state(&self, state: SessionState, timeout: Duration) -> HostResult<()> {
        let mut rx = self.shared.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(HostError::Closed),
            Err(_) => Err(HostError::Timeout(timeout)),
        }
    }

    /// Connect using the configured connect timeout.
    ///
    /// # Errors
    /// See [`Session::start_with_timeout`].
    pub async fn start(&self) -> HostResult<()> {
        self.start_with_timeout(self.shared.config.connect_timeout())
            .await
    }

    /// Connect to the host and perform the handshake within `timeout`.
    ///
    /// On success the session is `Running` and a
    /// [`SessionEvent::Connected`] is broadcast. On failure it is back to
    /// `Disconnected`.
    ///
    /// # Errors
    /// Returns [`HostError::AlreadyRunning`] unless the session is
    /// disconnected, [`HostError::Timeout`] if connecting takes too long,
    /// [`HostError::Connection`] if the transport fails, and
    /// [`HostError::Cancelled`] if `stop` interrupts the attempt.
    pub async fn start_with_timeout(&self, timeout: Duration) -> HostResult<()> {
        let token = CancellationToken::new();
        let epoch = {
            let mut link = lock(&self.shared.link);
            if !matches!(*link, Link::Idle) {
                return Err(HostError::AlreadyRunning);
            }
            *link = Link::Connecting(token.clone());
            self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.shared.state.send_replace(SessionState::Connecting);

        let span = self.shared.span.clone();
        let result = self.connect(epoch, &token, timeout).instrument(span).await;

        let mut link = lock(&self.shared.link);
        let current = self.shared.epoch.load(Ordering::SeqCst) == epoch;
        match result {
            Ok((correlator, version)) if !token.is_cancelled() && correlator.is_alive() => {
                *link = Link::Running(correlator);
                *lock(&self.shared.host_version) = Some(version.clone());
                *lock(&self.shared.last_reason) = None;
                // Published under the link lock so a concurrent link loss
                // is ordered after Running.
                self.shared.state.send_replace(SessionState::Running);
                let _ = self.shared.events.send(SessionEvent::Connected {
                    host_version: version,
                });
                drop(link);
                Ok(())
            }
            Ok((correlator, _)) if !token.is_cancelled() => {
                // The link died after the handshake, before it was installed.
                let reason = correlator
                    .failure()
                    .unwrap_or_else(|| "connection closed".to_string());
                if current && matches!(*link, Link::Connecting(_)) {
                    *link = Link::Idle;
                }
                drop(link);
                self.shared
                    .span
                    .in_scope(|| tracing::warn!(%reason, "Host disconnected during start"));
                if current {
                    self.shared.mark_disconnected(&reason);
                }
                Err(HostError::disconnected(reason))
            }
            result => {
                if current && matches!(*link, Link::Connecting(_)) {
                    *link = Link::Idle;
                }
                drop(link);
                let err = match result {
                    Ok((correlator, _)) => {
                        correlator.close("start aborted");
                        HostError::Cancelled
                    }
                    Err(err) => err,
                };
                self.shared
                    .span
                    .in_scope(|| tracing::warn!("Failed to start session: {err}"));
                if current {
                    *lock(&self.shared.last_reason) = Some(err.to_string());
                    self.shared.state.send_replace(SessionState::Disconnected);
                }
                Err(err)
            }
        }
    }

    async fn connect(
        &self,
        epoch: u64,
        token: &CancellationToken,
        timeout: Duration,
    ) -> HostResult<(Correlator, String)> {
        let scope = CancelScope::from_token(token.clone()).limited(timeout);
        let endpoint = &self.shared.config.endpoint;
        tracing::info!("Connecting to host");

        let channel = tokio::select! {
            channel = self.shared.transport.connect(endpoint) => channel?,
            () = scope.cancelled() => return Err(scope.error()),
        };

        let weak = Arc::downgrade(&self.shared);
        let correlator = Correlator::spawn(
            channel,
            self.shared.config.cancel_grace(),
            self.shared.span.clone(),
            move |reason| link_lost(&weak, epoch, &reason),
        );

        let version = match correlator.submit(HostRequest::Handshake, &scope, None).await {
            Ok(HostReply::Handshake { version }) => version,
            Ok(other) => {
                correlator.close("handshake failed");
                return Err(HostError::Protocol(format!(
                    "unexpected handshake reply: {other:?}"
                )));
            }
            Err(err) => {
                correlator.close("handshake failed");
                return Err(if err.is_cancellation() {
                    scope.error()
                } else {
                    err
                });
            }
        };

        tracing::info!(%version, "Connected to host");
        Ok((correlator, version))
    }

    /// Ask the host to shut down.
    ///
    /// With `wait` the caller is suspended until the session is
    /// disconnected; if that takes longer than `timeout` the connection is
    /// dropped forcibly. Without `wait` this returns once the request is
    /// sent and the transition completes in the background.
    ///
    /// # Errors
    /// Returns [`HostError::Timeout`] if the host did not shut down in time.
    pub async fn stop(&self, wait: bool, timeout: Duration) -> HostResult<()> {
        let correlator = match &*lock(&self.shared.link) {
            Link::Idle => return Ok(()),
            Link::Connecting(token) => {
                token.cancel();
                None
            }
            Link::Running(correlator) => Some(correlator.clone()),
        };

        if let Some(correlator) = correlator {
            self.shared
                .span
                .in_scope(|| tracing::info!("Stopping session"));
            if correlator.shutdown().is_err() {
                // The reader task is already tearing the link down.
                tracing::debug!("Host already gone");
            }
        }
        if !wait {
            return Ok(());
        }

        match self
            .wait_for_state(SessionState::Disconnected, timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                self.shared.span.in_scope(|| {
                    tracing::warn!(?timeout, "Host did not shut down in time, dropping connection");
                });
                self.teardown("host did not shut down in time");
                Err(HostError::Timeout(timeout))
            }
        }
    }

    /// Interrupt the running foreground request without ending the session.
    ///
    /// # Errors
    /// Returns [`HostError::Timeout`] if the host does not acknowledge in
    /// time, or a disconnection error when not running.
    pub async fn cancel_all(&self, timeout: Duration) -> HostResult<()> {
        self.correlator()?
            .interrupt(timeout)
            .instrument(self.shared.span.clone())
            .await
    }

    /// Send one request through the correlator and classify its reply.
    ///
    /// Host error replies become [`HostError::NotFound`],
    /// [`HostError::OutOfRange`] or [`HostError::Protocol`]; a cancelled
    /// reply becomes [`HostError::Cancelled`].
    ///
    /// # Errors
    /// Returns the classified error, the scope's cancellation error, or a
    /// disconnection error.
    pub async fn request(
        &self,
        request: HostRequest,
        scope: &CancelScope,
    ) -> HostResult<HostReply> {
        self.request_inner(request, scope, None).await
    }

    /// Like [`Session::request`], delivering the host's console output for
    /// this call to `output` until the call resolves.
    ///
    /// # Errors
    /// See [`Session::request`].
    pub async fn request_with_output(
        &self,
        request: HostRequest,
        scope: &CancelScope,
        output: OutputSink,
    ) -> HostResult<HostReply> {
        self.request_inner(request, scope, Some(output)).await
    }

    async fn request_inner(
        &self,
        request: HostRequest,
        scope: &CancelScope,
        output: Option<OutputSink>,
    ) -> HostResult<HostReply> {
        let correlator = self.correlator()?;
        let reply = correlator
            .submit(request, scope, output)
            .instrument(self.shared.span.clone())
            .await?;
        match reply {
            HostReply::Error { kind, message } => Err(HostError::from_remote(kind, message)),
            HostReply::Cancelled => Err(HostError::Cancelled),
            other => Ok(other),
        }
    }

    /// Epoch of the current connection; changes on every start attempt.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    fn correlator(&self) -> HostResult<Correlator> {
        match &*lock(&self.shared.link) {
            Link::Running(correlator) if correlator.is_alive() => Ok(correlator.clone()),
            _ => Err(HostError::disconnected(
                lock(&self.shared.last_reason)
                    .clone()
                    .unwrap_or_else(|| "session is not running".to_string()),
            )),
        }
    }

    fn teardown(&self, reason: &str) {
        let previous = std::mem::replace(&mut *lock(&self.shared.link), Link::Idle);
        match previous {
            Link::Running(correlator) => {
                correlator.close(reason);
                self.shared.mark_disconnected(reason);
            }
            Link::Connecting(token) => token.cancel(),
            Link::Idle => {}
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.config.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn mark_disconnected(&self, reason: &str) {
        *lock(&self.last_reason) = Some(reason.to_string());
        self.state.send_replace(SessionState::Disconnected);
        let _ = self.events.send(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
        self.span
            .in_scope(|| tracing::info!(reason, "Session disconnected"));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let link = std::mem::replace(
            self.link.get_mut().unwrap_or_else(PoisonError::into_inner),
            Link::Idle,
        );
        match link {
            Link::Running(correlator) => correlator.close("session dropped"),
            Link::Connecting(token) => token.cancel(),
            Link::Idle => {}
        }
    }
}

/// Called by the correlator's reader once its connection is gone.
fn link_lost(shared: &Weak<Shared>, epoch: u64, reason: &str) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    {
        let mut link = lock(&shared.link);
        if shared.epoch.load(Ordering::SeqCst) != epoch || !matches!(*link, Link::Running(_)) {
            return;
        }
        *link = Link::Idle;
    }
    shared.mark_disconnected(reason);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
