//! In-memory [`BackendDriver`] backed by [`DashMap`].
//!
//! Stands in for a remote store in tests and ephemeral deployments. Data
//! survives `close()`/`connect()` cycles of the same instance, the way a remote
//! store outlives its clients. Expiry is lazy: expired entries read as absent
//! and are dropped when touched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keyway_core::clock::{expires_at, ClockSource, SystemClock};

use crate::traits::{BackendDriver, CasOutcome};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    /// Absolute millis since epoch; `None` = never expires.
    expires_at: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Concurrent in-memory store with TTL support and an atomic CAS.
pub struct MemoryDriver {
    entries: DashMap<Bytes, StoredValue>,
    clock: Arc<dyn ClockSource>,
    atomic_cas: bool,
    open: AtomicBool,
}

impl MemoryDriver {
    /// Creates an empty store reading the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            atomic_cas: true,
            open: AtomicBool::new(false),
        }
    }

    /// Stops advertising compare-and-swap, so callers take their non-atomic
    /// fallback path.
    #[must_use]
    pub fn without_compare_and_swap(mut self) -> Self {
        self.atomic_cas = false;
        self
    }

    /// Number of live (unexpired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            anyhow::bail!("memory driver is closed")
        }
    }

    fn load(&self, key: &[u8], now: u64) -> Option<Bytes> {
        let hit = self.entries.get(key).map(|e| e.value().clone())?;
        if hit.is_live(now) {
            Some(hit.value)
        } else {
            self.entries.remove_if(key, |_, v| !v.is_live(now));
            None
        }
    }

    fn store(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) {
        let now = self.clock.now();
        self.entries.insert(
            Bytes::copy_from_slice(key),
            StoredValue {
                value: Bytes::copy_from_slice(value),
                expires_at: ttl.map(|ttl| expires_at(now, ttl)),
            },
        );
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_compare_and_swap(&self) -> bool {
        self.atomic_cas
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn ready(&self) -> anyhow::Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.load(key, self.clock.now()))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.store(key, value, None);
        Ok(())
    }

    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.store(key, value, Some(ttl));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> anyhow::Result<CasOutcome> {
        self.ensure_open()?;
        let now = self.clock.now();
        let replacement = StoredValue {
            value: Bytes::copy_from_slice(new),
            expires_at: ttl.map(|ttl| expires_at(now, ttl)),
        };

        // The entry guard holds the shard lock for the whole check-and-write.
        let outcome = match self.entries.entry(Bytes::copy_from_slice(key)) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let previous = current.is_live(now).then(|| current.value.clone());
                let swapped = previous.as_deref() == expected;
                if swapped {
                    occupied.insert(replacement);
                }
                CasOutcome { previous, swapped }
            }
            Entry::Vacant(vacant) => {
                let swapped = expected.is_none();
                if swapped {
                    vacant.insert(replacement);
                }
                CasOutcome {
                    previous: None,
                    swapped,
                }
            }
        };
        Ok(outcome)
    }

    async fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn batch_get(&self, keys: &[Bytes]) -> anyhow::Result<Vec<Option<Bytes>>> {
        self.ensure_open()?;
        let now = self.clock.now();
        Ok(keys.iter().map(|k| self.load(k, now)).collect())
    }

    async fn batch_put(&self, pairs: &[(Bytes, Bytes)]) -> anyhow::Result<()> {
        self.ensure_open()?;
        for (key, value) in pairs {
            self.store(key, value, None);
        }
        Ok(())
    }

    async fn batch_delete(&self, keys: &[Bytes]) -> anyhow::Result<()> {
        self.ensure_open()?;
        for key in keys {
            self.entries.remove(key.as_ref());
        }
        Ok(())
    }
}
