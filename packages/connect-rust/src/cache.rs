//! Cache contract (get / set / add / delete with TTL) over a shared driver.
//!
//! The adapter connects lazily on first use. Each backend call is bounded by
//! the caller's deadline, or by the connection's request timeout when the
//! caller sets none.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keyway_core::{CallContext, KvError, KvResult};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::connection::ConnectionManager;
use crate::instrument::observed;

#[derive(Debug)]
pub struct CacheAdapter {
    conn: Arc<ConnectionManager>,
    default_ttl: Option<Duration>,
    atomic_add: bool,
}

impl CacheAdapter {
    /// Wraps `conn`. Logs a warning when the driver has no atomic
    /// compare-and-swap, since [`add`](Self::add) then degrades to a
    /// check-then-set that can race with concurrent writers.
    #[must_use]
    pub fn new(conn: Arc<ConnectionManager>, config: &CacheConfig) -> Self {
        let atomic_add = conn.supports_compare_and_swap();
        if !atomic_add {
            warn!(
                backend = conn.backend_name(),
                "backend has no atomic compare-and-swap; add falls back to a racy check-then-set"
            );
        }
        Self {
            conn,
            default_ttl: config.default_ttl(),
            atomic_add,
        }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    /// Connects eagerly instead of on first use.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&self, ctx: &CallContext) -> KvResult<()> {
        self.conn.connect(ctx).await
    }

    /// # Errors
    ///
    /// See [`ConnectionManager::close`].
    pub async fn close(&self, ctx: &CallContext) -> KvResult<()> {
        self.conn.close(ctx).await
    }

    /// Per-call TTL wins over the configured default; neither means no expiry.
    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or(self.default_ttl)
    }

    /// Loads the value stored at `key`.
    ///
    /// # Errors
    ///
    /// [`KvError::KeyNotFound`] when the key is absent or expired; connection
    /// and transport failures otherwise.
    pub async fn get(&self, ctx: &CallContext, key: &[u8]) -> KvResult<Bytes> {
        observed("cache", "get", async {
            let driver = self.conn.acquire(ctx).await?;
            debug!(key = %String::from_utf8_lossy(key), "cache get");
            let found = ctx
                .or_timeout(self.conn.request_timeout())
                .run(async {
                    driver
                        .get(key)
                        .await
                        .map_err(|e| KvError::transport_for_key("get", key, e))
                })
                .await?;
            found.ok_or(KvError::KeyNotFound)
        })
        .await
    }

    /// Stores `value` unconditionally.
    ///
    /// # Errors
    ///
    /// Connection and transport failures.
    pub async fn set(
        &self,
        ctx: &CallContext,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        observed("cache", "set", self.store(ctx, key, value, self.effective_ttl(ttl))).await
    }

    async fn store(
        &self,
        ctx: &CallContext,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        let driver = self.conn.acquire(ctx).await?;
        debug!(key = %String::from_utf8_lossy(key), ttl = ?ttl, "cache set");
        ctx.or_timeout(self.conn.request_timeout())
            .run(async {
                let stored = match ttl {
                    None => driver.put(key, value).await,
                    Some(ttl) => driver.put_with_ttl(key, value, ttl).await,
                };
                stored.map_err(|e| KvError::transport_for_key("set", key, e))
            })
            .await
    }

    /// Stores `value` only if `key` holds no live value.
    ///
    /// # Errors
    ///
    /// [`KvError::KeyAlreadyExists`] when the key is present and unexpired;
    /// connection and transport failures otherwise.
    pub async fn add(
        &self,
        ctx: &CallContext,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        let ttl = self.effective_ttl(ttl);
        observed("cache", "add", async {
            if !self.atomic_add {
                return self.add_check_then_set(ctx, key, value, ttl).await;
            }

            let driver = self.conn.acquire(ctx).await?;
            debug!(key = %String::from_utf8_lossy(key), "cache add");
            let outcome = ctx
                .or_timeout(self.conn.request_timeout())
                .run(async {
                    driver
                        .compare_and_swap(key, None, value, ttl)
                        .await
                        .map_err(|e| KvError::transport_for_key("add", key, e))
                })
                .await?;
            if outcome.swapped {
                Ok(())
            } else {
                Err(KvError::KeyAlreadyExists)
            }
        })
        .await
    }

    /// Non-atomic add for drivers without compare-and-swap. A concurrent
    /// writer can slip in between the read and the write.
    async fn add_check_then_set(
        &self,
        ctx: &CallContext,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        let driver = self.conn.acquire(ctx).await?;
        let existing = ctx
            .or_timeout(self.conn.request_timeout())
            .run(async {
                driver
                    .get(key)
                    .await
                    .map_err(|e| KvError::transport_for_key("add", key, e))
            })
            .await?;
        if existing.is_some() {
            return Err(KvError::KeyAlreadyExists);
        }
        self.store(ctx, key, value, ttl).await
    }

    /// Removes `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Connection and transport failures.
    pub async fn delete(&self, ctx: &CallContext, key: &[u8]) -> KvResult<()> {
        observed("cache", "delete", async {
            let driver = self.conn.acquire(ctx).await?;
            debug!(key = %String::from_utf8_lossy(key), "cache delete");
            ctx.or_timeout(self.conn.request_timeout())
                .run(async {
                    driver
                        .delete(key)
                        .await
                        .map_err(|e| KvError::transport_for_key("delete", key, e))
                })
                .await
        })
        .await
    }
}
