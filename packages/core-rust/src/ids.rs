//! Injectable request-id generation.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of unique identifiers for outbound requests and generated keys.
pub trait RequestIdSource: Send + Sync {
    /// Returns a fresh identifier.
    fn next_id(&self) -> String;
}

/// Random UUID v4 identifiers (hyphenated form).
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSource;

impl RequestIdSource for UuidSource {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic `prefix-N` identifiers, counting from 1.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl RequestIdSource for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}
