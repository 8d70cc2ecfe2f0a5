//! Error taxonomy shared by the cache, processor, connection and stream layers.

/// Errors surfaced to callers of the cache contract, batch processor and
/// stream writer.
///
/// Drivers report failures as `anyhow::Error`; the caller-facing layers lift
/// them into [`KvError::Transport`] with the operation name and key attached.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key not found")]
    KeyNotFound,
    #[error("key already exists")]
    KeyAlreadyExists,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection to {backend} failed after {attempts} attempt(s): {source}")]
    Connection {
        backend: &'static str,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("{op} failed{}: {source}", key_suffix(.key.as_deref()))]
    Transport {
        op: &'static str,
        key: Option<String>,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to resolve item {index}: {source}")]
    Resolve {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

fn key_suffix(key: Option<&str>) -> String {
    key.map(|k| format!(" for key {k:?}")).unwrap_or_default()
}

impl KvError {
    /// Wraps a driver failure for an operation without a single key.
    pub fn transport(op: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Transport {
            op,
            key: None,
            source: source.into(),
        }
    }

    /// Wraps a driver failure for a point operation on `key`.
    pub fn transport_for_key(
        op: &'static str,
        key: &[u8],
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Transport {
            op,
            key: Some(String::from_utf8_lossy(key).into_owned()),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound)
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::KeyAlreadyExists)
    }

    /// Whether the failure came from cancellation or a deadline, not the backend.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout { .. })
    }
}

pub type KvResult<T> = Result<T, KvError>;
