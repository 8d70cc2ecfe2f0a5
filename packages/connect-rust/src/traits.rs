use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Result of a [`BackendDriver::compare_and_swap`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasOutcome {
    /// The value present at the moment of the atomic check, if any.
    pub previous: Option<Bytes>,
    /// Whether the new value was written.
    pub swapped: bool,
}

/// Pluggable client for an external key/value or document store.
/// Implementations: embedded `redb`, `PostgreSQL`, in-memory (tests).
///
/// Every method may perform I/O. Batch calls are best-effort unless the
/// backend guarantees atomicity natively; callers must not assume
/// all-or-nothing semantics.
///
/// Used as `Arc<dyn BackendDriver>`, owned by a
/// [`ConnectionManager`](crate::connection::ConnectionManager).
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Short backend name for logs and errors (e.g., `"redb"`).
    fn name(&self) -> &'static str;

    /// Whether [`compare_and_swap`](Self::compare_and_swap) is a true atomic
    /// primitive on this backend.
    fn supports_compare_and_swap(&self) -> bool {
        true
    }

    /// Establish the underlying client. Called once per connection lifetime.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Readiness probe. `Err` means "not ready yet"; the connection manager
    /// retries it a bounded number of times.
    async fn ready(&self) -> anyhow::Result<()>;

    /// Release the underlying client.
    async fn close(&self) -> anyhow::Result<()>;

    /// Load a single value. `None` if absent or expired.
    async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Bytes>>;

    /// Store a value with no expiry.
    async fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;

    /// Store a value that expires after `ttl`.
    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> anyhow::Result<()>;

    /// Atomically replace the value at `key` with `new` if the current value
    /// equals `expected` (`None` = key must be absent).
    ///
    /// `ttl` applies to the new value when the swap succeeds.
    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> anyhow::Result<CasOutcome>;

    /// Remove a value. Deleting an absent key is not an error.
    async fn delete(&self, key: &[u8]) -> anyhow::Result<()>;

    /// Load many values. The result has the same length and order as `keys`.
    async fn batch_get(&self, keys: &[Bytes]) -> anyhow::Result<Vec<Option<Bytes>>>;

    /// Store many key/value pairs with no expiry.
    async fn batch_put(&self, pairs: &[(Bytes, Bytes)]) -> anyhow::Result<()>;

    /// Remove many keys. Absent keys are ignored.
    async fn batch_delete(&self, keys: &[Bytes]) -> anyhow::Result<()>;
}
