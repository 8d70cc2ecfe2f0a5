//! Write-only sink: upserts every message of a batch in one backend call.

use std::sync::Arc;

use keyway_core::{
    CallContext, Identity, KvResult, Message, MetadataKey, RequestIdSource, SharedResolver, UuidSource,
};
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::processor::BatchProcessor;

#[derive(Debug)]
pub struct BatchWriter {
    processor: BatchProcessor,
}

impl BatchWriter {
    /// Keys each message by its `id` metadata entry, or a fresh UUID v4 when
    /// absent, and stores the message content unchanged.
    #[must_use]
    pub fn new(conn: Arc<ConnectionManager>) -> Self {
        Self::with_id_source(conn, Arc::new(UuidSource))
    }

    /// Like [`new`](Self::new) but draws fallback ids from `ids`.
    #[must_use]
    pub fn with_id_source(conn: Arc<ConnectionManager>, ids: Arc<dyn RequestIdSource>) -> Self {
        Self::with_resolvers(
            conn,
            Arc::new(MetadataKey::new("id").or_generate(ids)),
            Arc::new(Identity),
        )
    }

    #[must_use]
    pub fn with_resolvers(conn: Arc<ConnectionManager>, key: SharedResolver, content: SharedResolver) -> Self {
        Self {
            processor: BatchProcessor::upsert(conn, key, content),
        }
    }

    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&self, ctx: &CallContext) -> KvResult<()> {
        self.processor.connect(ctx).await
    }

    /// Writes all of `batch` with a single batch put.
    ///
    /// # Errors
    ///
    /// Resolution, connection and transport failures of the batch.
    pub async fn write_batch(&self, ctx: &CallContext, batch: &[Message]) -> KvResult<()> {
        let written = self.processor.process_batch(ctx, batch).await?;
        debug!(items = written.len(), "batch written");
        Ok(())
    }

    /// # Errors
    ///
    /// See [`ConnectionManager::close`].
    pub async fn close(&self, ctx: &CallContext) -> KvResult<()> {
        self.processor.close(ctx).await
    }
}
