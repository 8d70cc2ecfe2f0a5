//! Per-item key and content resolution.
//!
//! The pipeline's templating engine lives outside this crate. Processors only
//! see it through [`Resolver`], which turns one message into already-resolved
//! bytes. A few plain resolvers cover the common cases.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use bytes::Bytes;

use crate::ids::RequestIdSource;
use crate::message::Message;

/// Resolves a key or value from a single message.
pub trait Resolver: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the message does not carry what the resolver
    /// needs (missing field, wrong type).
    fn resolve(&self, msg: &Message) -> anyhow::Result<Bytes>;
}

/// Shared, type-erased resolver.
pub type SharedResolver = Arc<dyn Resolver>;

/// Returns the message content unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Resolver for Identity {
    fn resolve(&self, msg: &Message) -> anyhow::Result<Bytes> {
        Ok(msg.content().clone())
    }
}

/// Always resolves to the same bytes.
#[derive(Debug, Clone)]
pub struct Literal(pub Bytes);

impl Resolver for Literal {
    fn resolve(&self, _msg: &Message) -> anyhow::Result<Bytes> {
        Ok(self.0.clone())
    }
}

/// Reads a metadata entry, optionally falling back to a generated id.
pub struct MetadataKey {
    name: String,
    fallback: Option<Arc<dyn RequestIdSource>>,
}

impl MetadataKey {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fallback: None,
        }
    }

    /// Uses a fresh id from `ids` when the metadata entry is absent.
    #[must_use]
    pub fn or_generate(mut self, ids: Arc<dyn RequestIdSource>) -> Self {
        self.fallback = Some(ids);
        self
    }
}

impl fmt::Debug for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataKey")
            .field("name", &self.name)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Resolver for MetadataKey {
    fn resolve(&self, msg: &Message) -> anyhow::Result<Bytes> {
        match (msg.metadata(&self.name), &self.fallback) {
            (Some(v), _) => Ok(Bytes::copy_from_slice(v.as_bytes())),
            (None, Some(ids)) => Ok(Bytes::from(ids.next_id())),
            (None, None) => Err(anyhow!("metadata field {:?} is not set", self.name)),
        }
    }
}

/// Reads a top-level field of a JSON message.
///
/// Strings resolve to their raw bytes; any other JSON value resolves to its
/// compact serialization.
#[derive(Debug, Clone)]
pub struct JsonField(pub String);

impl Resolver for JsonField {
    fn resolve(&self, msg: &Message) -> anyhow::Result<Bytes> {
        let doc = msg
            .as_structured()
            .context("message content is not valid JSON")?;
        match doc.get(&self.0) {
            Some(serde_json::Value::String(s)) => Ok(Bytes::from(s.clone())),
            Some(serde_json::Value::Null) | None => {
                Err(anyhow!("field {:?} is missing from message", self.0))
            }
            Some(other) => Ok(Bytes::from(serde_json::to_vec(other)?)),
        }
    }
}

/// Adapts a closure into a [`Resolver`].
pub struct FnResolver<F>(F);

/// Builds a resolver from a closure.
pub fn resolver_fn<F>(f: F) -> FnResolver<F>
where
    F: Fn(&Message) -> anyhow::Result<Bytes> + Send + Sync,
{
    FnResolver(f)
}

impl<F> Resolver for FnResolver<F>
where
    F: Fn(&Message) -> anyhow::Result<Bytes> + Send + Sync,
{
    fn resolve(&self, msg: &Message) -> anyhow::Result<Bytes> {
        (self.0)(msg)
    }
}
