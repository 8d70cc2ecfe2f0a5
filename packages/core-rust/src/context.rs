//! Per-call cancellation and deadline context.
//!
//! Every caller-facing operation takes a [`CallContext`]. Network futures are
//! raced against the context's cancellation token and deadline, so a cancelled
//! or expired call returns promptly with [`KvError::Cancelled`] or
//! [`KvError::Timeout`] instead of hanging.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{KvError, KvResult};

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl CallContext {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns a copy whose deadline is `timeout` unless one is already set.
    #[must_use]
    pub fn or_timeout(&self, timeout: Duration) -> Self {
        Self {
            cancel: self.cancel.clone(),
            timeout: self.timeout.or(Some(timeout)),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `fut` under this context's cancellation and deadline.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Cancelled`] if the token fires first,
    /// [`KvError::Timeout`] if the deadline elapses first, otherwise whatever
    /// `fut` returns.
    pub async fn run<F, T>(&self, fut: F) -> KvResult<T>
    where
        F: Future<Output = KvResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(KvError::Cancelled);
        }

        let guarded = async {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(KvError::Cancelled),
                res = fut => res,
            }
        };

        match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, guarded).await {
                Ok(res) => res,
                Err(_elapsed) => Err(KvError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
            None => guarded.await,
        }
    }

    /// Sleeps for `duration` unless cancelled first. Ignores the deadline.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Cancelled`] if the token fires during the sleep.
    pub async fn sleep(&self, duration: Duration) -> KvResult<()> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(KvError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
