//! Session configuration.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the host lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// Host or broker listening on a TCP address (`host:port`).
    Tcp { address: String },
    /// Host listening on a Unix domain socket.
    Unix { path: PathBuf },
    /// Host started as a child process speaking over stdin/stdout.
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// In-process host, used for tests and embedding.
    Memory,
}

impl Endpoint {
    /// True when the host is reached over the network on another machine.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        let Self::Tcp { address } = self else {
            return false;
        };
        let host = address
            .rsplit_once(':')
            .map_or(address.as_str(), |(host, _)| host)
            .trim_start_matches('[')
            .trim_end_matches(']');
        if host.eq_ignore_ascii_case("localhost") {
            return false;
        }
        host.parse::<IpAddr>().map_or(true, |ip| !ip.is_loopback())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { address } => write!(f, "tcp://{address}"),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Process { command, .. } => write!(f, "process:{command}"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_cancel_grace_ms() -> u64 {
    5_000
}

const fn default_stop_timeout_ms() -> u64 {
    10_000
}

/// Settings for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Human readable session name, used in logs.
    #[serde(default)]
    pub name: String,

    /// Host location.
    pub endpoint: Endpoint,

    /// Upper bound for `start` when the caller passes no timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long the host may take to confirm an abort before the session
    /// is declared disconnected.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Upper bound for `stop` when the caller passes no timeout.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl SessionConfig {
    /// Config with default timeouts.
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            connect_timeout_ms: default_connect_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }

    /// Parse a JSON document.
    ///
    /// # Errors
    /// Returns error if the document is malformed.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Override the abort confirmation grace period.
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = duration_ms(grace);
        self
    }

    /// Override the default connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
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
        let config = SessionConfig::from_json(
            r#"{"endpoint":{"kind":"process","command":"Rhost --quiet"}}"#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.cancel_grace(), Duration::from_secs(5));
        assert!(matches!(config.endpoint, Endpoint::Process { ref args, .. } if args.is_empty()));
    }

    #[test]
    fn test_is_remote() {
        let tcp = |a: &str| Endpoint::Tcp {
            address: a.to_string(),
        };
        assert!(!tcp("127.0.0.1:5118").is_remote());
        assert!(!tcp("localhost:5118").is_remote());
        assert!(!tcp("[::1]:5118").is_remote());
        assert!(tcp("10.0.0.4:5118").is_remote());
        assert!(tcp("broker.example.com:443").is_remote());
        assert!(!Endpoint::Memory.is_remote());
    }
}
