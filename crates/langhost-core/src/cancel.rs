//! Caller-supplied cancellation scopes with optional deadlines.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::HostError;

/// Handle a caller uses to abandon an operation.
///
/// Cloning shares the same underlying token. A scope with a deadline
/// cancels itself once the deadline passes.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl CancelScope {
    /// Scope without a deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope that expires `timeout` from now.
    ///
    /// A timeout too large to represent as an instant means no deadline.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now().checked_add(timeout).map(|at| (at, timeout)),
        }
    }

    /// Scope that expires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        let timeout = deadline.saturating_duration_since(Instant::now());
        Self {
            token: CancellationToken::new(),
            deadline: Some((deadline, timeout)),
        }
    }

    /// Scope wrapping an existing token.
    #[must_use]
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derived scope cancelled together with this one. Keeps the deadline.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Same scope, additionally expiring `timeout` from now.
    ///
    /// An earlier existing deadline is kept.
    #[must_use]
    pub fn limited(mut self, timeout: Duration) -> Self {
        let Some(at) = Instant::now().checked_add(timeout) else {
            return self;
        };
        match self.deadline {
            Some((current, _)) if current <= at => {}
            _ => self.deadline = Some((at, timeout)),
        }
        self
    }

    /// Cancel this scope and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancelled or past the deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline_passed()
    }

    /// Time left before the deadline, if there is one.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }

    /// Resolves when the scope is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some((at, _)) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(at) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// The error to report for a cancelled scope.
    ///
    /// Explicit cancellation wins over an expired deadline.
    #[must_use]
    pub fn error(&self) -> HostError {
        match self.deadline {
            Some((_, timeout)) if !self.token.is_cancelled() && self.deadline_passed() => {
                HostError::Timeout(timeout)
            }
            _ => HostError::Cancelled,
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|(at, _)| Instant::now() >= at)
    }
}
