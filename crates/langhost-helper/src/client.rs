//! Helper client.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::config::HelperConfig;
use crate::error::HelperError;
use crate::message::{self, ProfileRequest, ProfileResponse};

/// Largest response document the client accepts.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Issues single requests to a helper.
#[derive(Debug, Clone)]
pub struct HelperClient {
    config: HelperConfig,
}

impl HelperClient {
    /// Create a new helper client.
    #[must_use]
    pub const fn new(config: HelperConfig) -> Self {
        Self { config }
    }

    /// Connect to the configured channel and perform one exchange.
    ///
    /// # Errors
    /// Returns error if the channel is unreachable, the exchange exceeds
    /// the client timeout, or the response is malformed.
    #[cfg(unix)]
    pub async fn request(&self, request: &ProfileRequest) -> Result<ProfileResponse, HelperError> {
        let stream = tokio::net::UnixStream::connect(&self.config.channel).await?;
        self.exchange(stream, request).await
    }

    /// Perform one exchange over an established connection.
    ///
    /// Sends the request, reads the response and closes the write side so
    /// the server sees the disconnect.
    ///
    /// # Errors
    /// Returns [`HelperError::Timeout`] if the exchange exceeds the client
    /// timeout, plus framing errors.
    pub async fn exchange<S>(
        &self,
        mut stream: S,
        request: &ProfileRequest,
    ) -> Result<ProfileResponse, HelperError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.config.client_timeout();
        let round_trip = async {
            message::write_frame(&mut stream, request).await?;
            let response: ProfileResponse =
                message::read_frame(&mut stream, MAX_RESPONSE_BYTES).await?;
            stream.shutdown().await?;
            Ok::<_, HelperError>(response)
        };
        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| HelperError::Timeout(timeout))?
    }
}
