//! Helper channel configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const SOCKET_NAME: &str = "langhost-helper.sock";

/// Default channel location.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/langhost-helper.sock`
/// 2. the platform runtime or cache directory
/// 3. the system temp directory
#[must_use]
pub fn default_channel_path() -> PathBuf {
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(SOCKET_NAME);
    }
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_NAME)
}

const fn default_server_timeout_ms() -> u64 {
    30_000
}

const fn default_client_timeout_ms() -> u64 {
    5_000
}

const fn default_max_request_bytes() -> usize {
    16 * 1024
}

/// Settings shared by the helper server and client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Local socket the server listens on.
    #[serde(default = "default_channel_path")]
    pub channel: PathBuf,

    /// Time the server allows itself to receive and answer a request.
    #[serde(default = "default_server_timeout_ms")]
    pub server_timeout_ms: u64,

    /// Time a client gets to send its request and read the answer.
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,

    /// Largest encoded request the server accepts.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            channel: default_channel_path(),
            server_timeout_ms: default_server_timeout_ms(),
            client_timeout_ms: default_client_timeout_ms(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

impl HelperConfig {
    /// Default settings on a specific channel.
    #[must_use]
    pub fn with_channel(channel: impl Into<PathBuf>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, server: Duration, client: Duration) -> Self {
        self.server_timeout_ms = duration_ms(server);
        self.client_timeout_ms = duration_ms(client);
        self
    }

    #[must_use]
    pub const fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    #[must_use]
    pub const fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    /// Budget for one whole exchange, from accept to disconnect.
    #[must_use]
    pub const fn exchange_timeout(&self) -> Duration {
        self.server_timeout().saturating_add(self.client_timeout())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let config: HelperConfig =
            serde_json::from_str(r#"{"channel":"/run/test.sock","client_timeout_ms":250}"#)
                .unwrap();
        assert_eq!(config.channel, PathBuf::from("/run/test.sock"));
        assert_eq!(config.server_timeout(), Duration::from_secs(30));
        assert_eq!(config.exchange_timeout(), Duration::from_millis(30_250));
        assert_eq!(config.max_request_bytes, 16 * 1024);
    }

    #[test]
    fn test_default_channel_path_has_socket_name() {
        assert!(default_channel_path().ends_with(SOCKET_NAME));
    }

    #[test]
    fn test_oversized_timeouts_saturate() {
        let config = HelperConfig::with_channel("/run/test.sock")
            .with_timeouts(Duration::MAX, Duration::from_millis(1500));
        assert_eq!(config.server_timeout_ms, u64::MAX);
        assert_eq!(config.client_timeout_ms, 1500);
        assert_eq!(
            config.exchange_timeout(),
            Duration::from_millis(u64::MAX) + Duration::from_millis(1500)
        );
    }
}
