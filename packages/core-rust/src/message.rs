//! Pipeline messages as seen by the batch processor and writers.
//!
//! A [`Message`] is the unit the surrounding pipeline hands over: raw content,
//! string metadata, and an optional per-item error that the processor attaches
//! when an individual item fails without aborting its batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::KvError;

/// Ordered batch of messages. Identity of an item is its index.
pub type MessageBatch = Vec<Message>;

#[derive(Debug, Clone, Default)]
pub struct Message {
    content: Bytes,
    metadata: BTreeMap<String, String>,
    error: Option<Arc<KvError>>,
}

impl Message {
    #[must_use]
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
            error: None,
        }
    }

    /// Builder-style metadata insertion.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.content = content.into();
    }

    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// The error attached to this item, if processing it failed.
    #[must_use]
    pub fn error(&self) -> Option<&KvError> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: KvError) {
        self.error = Some(Arc::new(error));
    }

    /// Parses the content as a JSON document.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the content is not valid JSON.
    pub fn as_structured(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_no_error() {
        let msg = Message::new("hello");
        assert_eq!(msg.content().as_ref(), b"hello");
        assert!(msg.error().is_none());
    }

    #[test]
    fn set_error_is_visible_on_clones() {
        let mut msg = Message::new("x");
        msg.set_error(KvError::KeyNotFound);
        let copy = msg.clone();
        assert!(copy.error().is_some_and(KvError::is_not_found));
    }

    #[test]
    fn metadata_lookup() {
        let msg = Message::new("x").with_metadata("id", "42");
        assert_eq!(msg.metadata("id"), Some("42"));
        assert_eq!(msg.metadata("missing"), None);
    }

    #[test]
    fn as_structured_parses_json() {
        let msg = Message::new(r#"{"id":"foo","n":1}"#);
        let doc = msg.as_structured().unwrap();
        assert_eq!(doc["id"], "foo");

        assert!(Message::new("not json").as_structured().is_err());
    }
}
