//! Batched key/value processor.
//!
//! Maps an ordered batch of messages to per-item keys (and values for `put`),
//! issues exactly one backend batch call, and writes results back per item.
//! Output item `i` always corresponds to input item `i`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use keyway_core::{CallContext, KvError, KvResult, Message, MessageBatch, SharedResolver};
use tracing::debug;

use crate::config::ProcessorConfig;
use crate::connection::ConnectionManager;
use crate::instrument::observed;

/// The single backend operation a processor performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Delete,
    Put,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Delete => "delete",
            Self::Put => "put",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Self::Get),
            "delete" => Ok(Self::Delete),
            "put" => Ok(Self::Put),
            other => Err(KvError::InvalidOperation(other.to_string())),
        }
    }
}

pub struct BatchProcessor {
    conn: Arc<ConnectionManager>,
    operation: Operation,
    key: SharedResolver,
    content: Option<SharedResolver>,
}

impl BatchProcessor {
    /// Validates the operation selector before anything touches the network.
    ///
    /// # Errors
    ///
    /// [`KvError::InvalidOperation`] for an unknown selector and
    /// [`KvError::InvalidConfiguration`] for `put` without a content resolver.
    pub fn new(
        conn: Arc<ConnectionManager>,
        config: &ProcessorConfig,
        key: SharedResolver,
        content: Option<SharedResolver>,
    ) -> KvResult<Self> {
        let operation: Operation = config.operation.parse()?;
        if operation == Operation::Put && content.is_none() {
            return Err(KvError::InvalidConfiguration(
                "content must be set for the put operation".to_string(),
            ));
        }
        Ok(Self {
            conn,
            operation,
            key,
            content,
        })
    }

    /// A `put` processor; the writer sink is built on this.
    pub(crate) fn upsert(conn: Arc<ConnectionManager>, key: SharedResolver, content: SharedResolver) -> Self {
        Self {
            conn,
            operation: Operation::Put,
            key,
            content: Some(content),
        }
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

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

    /// Runs the configured operation over `batch`.
    ///
    /// For `get`, a missing key is attached to that item as
    /// [`KvError::KeyNotFound`] and the rest of the batch is unaffected.
    ///
    /// # Errors
    ///
    /// Fails the whole invocation on a resolution failure
    /// ([`KvError::Resolve`]), a connection failure, or a transport failure of
    /// the batch call.
    pub async fn process_batch(&self, ctx: &CallContext, batch: &[Message]) -> KvResult<MessageBatch> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        observed("processor", self.operation.as_str(), async {
            let keys = resolve_all(&*self.key, batch)?;
            match self.operation {
                Operation::Get => self.get(ctx, batch, &keys).await,
                Operation::Delete => self.delete(ctx, batch, &keys).await,
                Operation::Put => self.put(ctx, batch, keys).await,
            }
        })
        .await
    }

    async fn get(&self, ctx: &CallContext, batch: &[Message], keys: &[Bytes]) -> KvResult<MessageBatch> {
        let driver = self.conn.acquire(ctx).await?;
        let values = ctx
            .or_timeout(self.conn.request_timeout())
            .run(async {
                driver
                    .batch_get(keys)
                    .await
                    .map_err(|e| KvError::transport("batch_get", e))
            })
            .await?;
        if values.len() != keys.len() {
            return Err(KvError::transport(
                "batch_get",
                anyhow::anyhow!(
                    "driver returned {} results for {} keys",
                    values.len(),
                    keys.len()
                ),
            ));
        }

        let mut misses = 0usize;
        let out = batch
            .iter()
            .zip(values)
            .map(|(msg, value)| {
                let mut msg = msg.clone();
                match value {
                    Some(value) => msg.set_content(value),
                    None => {
                        misses += 1;
                        msg.set_error(KvError::KeyNotFound);
                    }
                }
                msg
            })
            .collect();
        debug!(items = keys.len(), misses, "batch get complete");
        Ok(out)
    }

    async fn delete(&self, ctx: &CallContext, batch: &[Message], keys: &[Bytes]) -> KvResult<MessageBatch> {
        let driver = self.conn.acquire(ctx).await?;
        ctx.or_timeout(self.conn.request_timeout())
            .run(async {
                driver
                    .batch_delete(keys)
                    .await
                    .map_err(|e| KvError::transport("batch_delete", e))
            })
            .await?;
        debug!(items = keys.len(), "batch delete complete");
        Ok(batch.to_vec())
    }

    async fn put(&self, ctx: &CallContext, batch: &[Message], keys: Vec<Bytes>) -> KvResult<MessageBatch> {
        let Some(content) = &self.content else {
            return Err(KvError::InvalidConfiguration(
                "content must be set for the put operation".to_string(),
            ));
        };
        let values = resolve_all(&**content, batch)?;
        let pairs: Vec<(Bytes, Bytes)> = keys.into_iter().zip(values).collect();

        let driver = self.conn.acquire(ctx).await?;
        ctx.or_timeout(self.conn.request_timeout())
            .run(async {
                driver
                    .batch_put(&pairs)
                    .await
                    .map_err(|e| KvError::transport("batch_put", e))
            })
            .await?;
        debug!(items = pairs.len(), "batch put complete");

        Ok(batch
            .iter()
            .zip(pairs)
            .map(|(msg, (_, value))| {
                let mut msg = msg.clone();
                msg.set_content(value);
                msg
            })
            .collect())
    }
}

fn resolve_all(resolver: &dyn keyway_core::Resolver, batch: &[Message]) -> KvResult<Vec<Bytes>> {
    batch
        .iter()
        .enumerate()
        .map(|(index, msg)| {
            resolver
                .resolve(msg)
                .map_err(|source| KvError::Resolve { index, source })
        })
        .collect()
}

impl fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("operation", &self.operation)
            .field("backend", &self.conn.backend_name())
            .finish_non_exhaustive()
    }
}
