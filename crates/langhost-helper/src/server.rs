//! Helper server: one request and one response per connection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::config::HelperConfig;
use crate::error::HelperError;
use crate::message::{self, ProfileRequest, ProfileResponse};

/// The privileged operation behind the helper.
#[async_trait]
pub trait ProfileHandler: Send + Sync {
    /// Answer a profile request. Failures are reported through
    /// [`ProfileResponse::error`].
    async fn handle(&self, request: ProfileRequest) -> ProfileResponse;
}

/// How an exchange ended. Exchanges never fail outward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The request was answered and the client disconnected.
    Completed,
    /// The request was unreadable and a blank response was sent.
    Rejected,
    /// The combined timeout expired and the connection was dropped.
    TimedOut,
    /// The channel failed or the client left without a request.
    Failed,
}

/// Serve a single exchange on `stream`.
///
/// The whole exchange (reading the request, answering it, writing the
/// response and waiting for the client to disconnect) shares one deadline
/// of `server_timeout + client_timeout`. A client that reads slowly is
/// therefore cut off as early as one that never writes.
pub async fn serve_exchange<S, H>(
    mut stream: S,
    handler: &H,
    config: &HelperConfig,
) -> ExchangeOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: ProfileHandler + ?Sized,
{
    let budget = config.exchange_timeout();
    match tokio::time::timeout(budget, exchange(&mut stream, handler, config)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Helper exchange failed");
            ExchangeOutcome::Failed
        }
        Err(_) => {
            tracing::warn!(timeout = ?budget, "Helper client timed out, disconnecting");
            ExchangeOutcome::TimedOut
        }
    }
}

async fn exchange<S, H>(
    stream: &mut S,
    handler: &H,
    config: &HelperConfig,
) -> Result<ExchangeOutcome, HelperError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: ProfileHandler + ?Sized,
{
    let (response, outcome) =
        match message::read_frame::<_, ProfileRequest>(stream, config.max_request_bytes).await {
            Ok(request) => {
                tracing::debug!(
                    user = %request.username,
                    domain = %request.domain,
                    "Helper request"
                );
                (handler.handle(request).await, ExchangeOutcome::Completed)
            }
            Err(HelperError::Closed) => {
                tracing::debug!("Helper client left without a request");
                return Ok(ExchangeOutcome::Failed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting helper request");
                (ProfileResponse::blank(), ExchangeOutcome::Rejected)
            }
        };

    message::write_frame(stream, &response).await?;
    wait_for_disconnect(stream).await?;
    Ok(outcome)
}

/// Drain the channel until the client closes its end.
async fn wait_for_disconnect<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), HelperError> {
    let mut sink = [0u8; message::READ_CHUNK];
    while stream.read(&mut sink).await? > 0 {}
    Ok(())
}

/// Helper endpoint serving exchanges one at a time.
pub struct HelperServer<H> {
    config: HelperConfig,
    handler: Arc<H>,
}

impl<H: ProfileHandler> HelperServer<H> {
    /// Create a new helper server.
    pub fn new(config: HelperConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HelperConfig {
        &self.config
    }

    /// Serve one exchange on an already accepted connection.
    pub async fn serve_stream<S>(&self, stream: S) -> ExchangeOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        serve_exchange(stream, self.handler.as_ref(), &self.config).await
    }
}

#[cfg(unix)]
impl<H: ProfileHandler> HelperServer<H> {
    /// Bind the configured channel, replacing a stale socket file.
    ///
    /// # Errors
    /// Returns error if the parent directory cannot be created or the
    /// socket cannot be bound.
    pub fn bind(&self) -> Result<tokio::net::UnixListener, HelperError> {
        let path = &self.config.channel;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(tokio::net::UnixListener::bind(path)?)
    }

    /// Accept and serve exchanges sequentially until `shutdown` fires.
    ///
    /// The socket file is removed on return.
    ///
    /// # Errors
    /// Returns error if the channel cannot be bound.
    pub async fn run(
        &self,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Result<(), HelperError> {
        let listener = self.bind()?;
        tracing::info!(channel = %self.config.channel.display(), "Helper listening");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let outcome = self.serve_stream(stream).await;
                        tracing::debug!(?outcome, "Helper exchange finished");
                    }
                    Err(e) => tracing::warn!(error = %e, "Helper accept failed"),
                },
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.config.channel) {
            tracing::debug!(error = %e, "Helper socket already gone");
        }
        tracing::info!("Helper stopped");
        Ok(())
    }
}
