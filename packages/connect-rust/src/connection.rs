//! Connection lifecycle for a single shared backend driver.
//!
//! The manager owns one [`BackendDriver`] and tracks whether it is connected.
//! Connect and close transitions are serialized behind an async mutex, while
//! the current state is published through `ArcSwap` so concurrent readers
//! never wait on a transition to check it.
//!
//! State machine: Disconnected -> (connect + readiness) -> Connected -> (close) -> Disconnected

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use keyway_core::{CallContext, KvError, KvResult};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReadinessPolicy};
use crate::traits::BackendDriver;

/// Whether the managed driver currently holds a live client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Owns the driver handle shared by a cache adapter, processor or writer.
pub struct ConnectionManager {
    driver: Arc<dyn BackendDriver>,
    readiness: ReadinessPolicy,
    request_timeout: Duration,
    state: ArcSwap<ConnectionState>,
    transition: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Wraps `driver` without touching the network.
    #[must_use]
    pub fn new(driver: Arc<dyn BackendDriver>, config: &ClientConfig) -> Self {
        Self {
            driver,
            readiness: config.readiness,
            request_timeout: config.request_timeout(),
            state: ArcSwap::from_pointee(ConnectionState::Disconnected),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.driver.name()
    }

    #[must_use]
    pub fn supports_compare_and_swap(&self) -> bool {
        self.driver.supports_compare_and_swap()
    }

    /// Default deadline for calls made through this connection.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Establishes the client and waits for the backend to report ready.
    ///
    /// A no-op when already connected. The context's own deadline, if any,
    /// bounds the whole connect; each individual probe is bounded by the
    /// configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Connection`] when client setup fails or the
    /// readiness budget is exhausted, and [`KvError::Cancelled`] /
    /// [`KvError::Timeout`] when the context interrupts the wait.
    pub async fn connect(&self, ctx: &CallContext) -> KvResult<()> {
        let _transition = self.transition.lock().await;
        if self.is_connected() {
            debug!(backend = self.backend_name(), "already connected");
            return Ok(());
        }

        let result = ctx.run(self.establish(ctx)).await;
        match result {
            Ok(()) => {
                self.state.store(Arc::new(ConnectionState::Connected));
                info!(backend = self.backend_name(), "connected");
                Ok(())
            }
            Err(err) => {
                // The client may be half-open; release it so the next connect starts clean.
                let released = ctx
                    .or_timeout(self.request_timeout)
                    .run(async {
                        self.driver
                            .close()
                            .await
                            .map_err(|e| KvError::transport("close", e))
                    })
                    .await;
                if let Err(close_err) = released {
                    warn!(backend = self.backend_name(), error = %close_err, "failed to release client after connect failure");
                }
                Err(err)
            }
        }
    }

    async fn establish(&self, ctx: &CallContext) -> KvResult<()> {
        let backend = self.backend_name();
        let probe_ctx = CallContext::new()
            .with_cancellation(ctx.cancellation().clone())
            .with_timeout(self.request_timeout);

        probe_ctx
            .run(async {
                self.driver
                    .connect()
                    .await
                    .map_err(|source| KvError::Connection {
                        backend,
                        attempts: 1,
                        source,
                    })
            })
            .await?;

        let attempts = self.readiness.attempts.max(1);
        let mut last_cause = anyhow::anyhow!("backend never probed");
        for attempt in 1..=attempts {
            let probe = probe_ctx
                .run(async {
                    self.driver
                        .ready()
                        .await
                        .map_err(|e| KvError::transport("ready", e))
                })
                .await;

            match probe {
                Ok(()) => {
                    debug!(backend, attempt, "backend ready");
                    return Ok(());
                }
                Err(KvError::Cancelled) => return Err(KvError::Cancelled),
                Err(err) => {
                    warn!(backend, attempt, attempts, error = %err, "backend not ready");
                    last_cause = anyhow::Error::new(err);
                }
            }

            if attempt < attempts {
                ctx.sleep(self.readiness.interval()).await?;
            }
        }

        Err(KvError::Connection {
            backend,
            attempts,
            source: last_cause,
        })
    }

    /// Releases the client. A no-op when not connected.
    ///
    /// State is reset to `Disconnected` before the driver is closed, so a
    /// failing close still leaves the manager ready for a fresh connect.
    ///
    /// # Errors
    ///
    /// Returns the driver's close failure as [`KvError::Transport`].
    pub async fn close(&self, ctx: &CallContext) -> KvResult<()> {
        let _transition = self.transition.lock().await;
        if !self.is_connected() {
            return Ok(());
        }

        self.state.store(Arc::new(ConnectionState::Disconnected));
        info!(backend = self.backend_name(), "closing connection");

        ctx.or_timeout(self.request_timeout)
            .run(async {
                self.driver
                    .close()
                    .await
                    .map_err(|e| KvError::transport("close", e))
            })
            .await
    }

    /// The driver, if connected.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotConnected`] before a successful connect.
    pub fn driver(&self) -> KvResult<Arc<dyn BackendDriver>> {
        if self.is_connected() {
            Ok(Arc::clone(&self.driver))
        } else {
            Err(KvError::NotConnected)
        }
    }

    /// The driver, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Propagates any [`connect`](Self::connect) failure.
    pub async fn acquire(&self, ctx: &CallContext) -> KvResult<Arc<dyn BackendDriver>> {
        if !self.is_connected() {
            self.connect(ctx).await?;
        }
        Ok(Arc::clone(&self.driver))
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &self.backend_name())
            .field("state", &self.state())
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}
