//! Embedded [`BackendDriver`] on top of [`redb`].
//!
//! redb serializes write transactions, so compare-and-swap and batch writes
//! run inside a single write transaction and are atomic. All database work is
//! blocking and runs on tokio's blocking pool.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use keyway_core::clock::{expires_at, ClockSource, SystemClock};
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::record;
use crate::config::RedbConfig;
use crate::traits::{BackendDriver, CasOutcome};

const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("keyway_kv");

pub struct RedbDriver {
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
    /// Handle dropped by `close` that in-flight calls may still hold.
    retired: Mutex<Weak<Database>>,
    clock: Arc<dyn ClockSource>,
}

impl RedbDriver {
    #[must_use]
    pub fn new(config: &RedbConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: &RedbConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            path: config.path.clone(),
            db: RwLock::new(None),
            retired: Mutex::new(Weak::new()),
            clock,
        }
    }

    fn handle(&self) -> anyhow::Result<Arc<Database>> {
        self.db
            .read()
            .clone()
            .context("redb driver is not connected")
    }

    /// Runs `f` against the open database on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.handle()?;
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("redb task failed to complete")?
    }

    async fn write_framed(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> anyhow::Result<()> {
        let key = key.to_vec();
        let framed = record::encode(value, ttl.map(|ttl| expires_at(self.clock.now(), ttl)));
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(KV)?;
                table.insert(key.as_slice(), framed.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BackendDriver for RedbDriver {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn connect(&self) -> anyhow::Result<()> {
        if self.db.read().is_some() {
            return Ok(());
        }
        // The file stays locked until the last clone is dropped; reuse it instead of reopening.
        let retired = self.retired.lock().upgrade();
        if let Some(db) = retired {
            debug!(path = %self.path.display(), "redb database reattached");
            *self.db.write() = Some(db);
            return Ok(());
        }

        let path = self.path.clone();
        let db = tokio::task::spawn_blocking(move || -> anyhow::Result<Database> {
            let db = Database::create(&path)
                .with_context(|| format!("failed to open redb database at {}", path.display()))?;
            // Create the table up front so read transactions never see it missing.
            let txn = db.begin_write()?;
            txn.open_table(KV)?;
            txn.commit()?;
            Ok(db)
        })
        .await
        .context("redb open task failed to complete")??;

        debug!(path = %self.path.display(), "redb database opened");
        *self.db.write() = Some(Arc::new(db));
        Ok(())
    }

    async fn ready(&self) -> anyhow::Result<()> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            txn.open_table(KV)?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the last handle closes the file; in-flight calls keep their clone.
        let taken = self.db.write().take();
        if let Some(db) = taken {
            *self.retired.lock() = Arc::downgrade(&db);
        }
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Bytes>> {
        let key = key.to_vec();
        let now = self.clock.now();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(KV)?;
            let value = match table.get(key.as_slice())? {
                Some(guard) => record::live_value(guard.value(), now)?.map(Bytes::copy_from_slice),
                None => None,
            };
            Ok(value)
        })
        .await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.write_framed(key, value, None).await
    }

    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        self.write_framed(key, value, Some(ttl)).await
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> anyhow::Result<CasOutcome> {
        let key = key.to_vec();
        let expected = expected.map(<[u8]>::to_vec);
        let now = self.clock.now();
        let framed = record::encode(new, ttl.map(|ttl| expires_at(now, ttl)));

        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let outcome = {
                let mut table = txn.open_table(KV)?;
                let previous = match table.get(key.as_slice())? {
                    Some(guard) => record::live_value(guard.value(), now)?.map(<[u8]>::to_vec),
                    None => None,
                };
                let swapped = previous == expected;
                if swapped {
                    table.insert(key.as_slice(), framed.as_slice())?;
                }
                CasOutcome {
                    previous: previous.map(Bytes::from),
                    swapped,
                }
            };
            if outcome.swapped {
                txn.commit()?;
            } else {
                txn.abort()?;
            }
            Ok(outcome)
        })
        .await
    }

    async fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let key = key.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(KV)?;
                table.remove(key.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn batch_get(&self, keys: &[Bytes]) -> anyhow::Result<Vec<Option<Bytes>>> {
        let keys = keys.to_vec();
        let now = self.clock.now();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(KV)?;
            let mut out = Vec::with_capacity(keys.len());
            for key in &keys {
                let value = match table.get(key.as_ref())? {
                    Some(guard) => record::live_value(guard.value(), now)?.map(Bytes::copy_from_slice),
                    None => None,
                };
                out.push(value);
            }
            Ok(out)
        })
        .await
    }

    async fn batch_put(&self, pairs: &[(Bytes, Bytes)]) -> anyhow::Result<()> {
        let framed: Vec<(Bytes, Vec<u8>)> = pairs
            .iter()
            .map(|(k, v)| (k.clone(), record::encode(v, None)))
            .collect();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(KV)?;
                for (key, value) in &framed {
                    table.insert(key.as_ref(), value.as_slice())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn batch_delete(&self, keys: &[Bytes]) -> anyhow::Result<()> {
        let keys = keys.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(KV)?;
                for key in &keys {
                    table.remove(key.as_ref())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use keyway_core::ManualClock;

    use super::*;

    async fn open_driver(dir: &tempfile::TempDir, clock: &ManualClock) -> RedbDriver {
        let config = RedbConfig {
            path: dir.path().join("kv.redb"),
        };
        let driver = RedbDriver::with_clock(&config, Arc::new(clock.clone()));
        driver.connect().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn calls_before_connect_fail() {
        let dir = tempfile::tempdir().unwrap();
        let driver = RedbDriver::new(&RedbConfig {
            path: dir.path().join("kv.redb"),
        });
        assert!(driver.get(b"k").await.is_err());
        assert!(driver.ready().await.is_err());
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir, &ManualClock::new(0)).await;
        driver.ready().await.unwrap();

        driver.put(b"k", b"v").await.unwrap();
        assert_eq!(driver.get(b"k").await.unwrap(), Some(Bytes::from("v")));

        driver.delete(b"k").await.unwrap();
        driver.delete(b"k").await.unwrap();
        assert!(driver.get(b"k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ttl_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(10_000);
        let driver = open_driver(&dir, &clock).await;

        driver
            .put_with_ttl(b"k", b"v", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(driver.get(b"k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(driver.get(b"k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cas_only_inserts_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir, &ManualClock::new(0)).await;

        assert!(driver.compare_and_swap(b"k", None, b"one", None).await.unwrap().swapped);
        let second = driver.compare_and_swap(b"k", None, b"two", None).await.unwrap();
        assert!(!second.swapped);
        assert_eq!(second.previous, Some(Bytes::from("one")));
        assert_eq!(driver.get(b"k").await.unwrap(), Some(Bytes::from("one")));
    }

    #[tokio::test]
    async fn batch_operations_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir, &ManualClock::new(0)).await;

        driver
            .batch_put(&[
                (Bytes::from("a"), Bytes::from("1")),
                (Bytes::from("b"), Bytes::from("2")),
            ])
            .await
            .unwrap();
        let out = driver
            .batch_get(&[Bytes::from("b"), Bytes::from("missing"), Bytes::from("a")])
            .await
            .unwrap();
        assert_eq!(out, vec![Some(Bytes::from("2")), None, Some(Bytes::from("1"))]);

        driver.batch_delete(&[Bytes::from("a"), Bytes::from("b")]).await.unwrap();
        let out = driver.batch_get(&[Bytes::from("a"), Bytes::from("b")]).await.unwrap();
        assert_eq!(out, vec![None, None]);
    }

    #[tokio::test]
    async fn data_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir, &ManualClock::new(0)).await;
        driver.put(b"k", b"v").await.unwrap();

        driver.close().await.unwrap();
        assert!(driver.get(b"k").await.is_err());

        driver.connect().await.unwrap();
        assert_eq!(driver.get(b"k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn reconnect_while_old_handle_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir, &ManualClock::new(0)).await;
        driver.put(b"k", b"v").await.unwrap();

        let in_flight = driver.handle().unwrap();
        driver.close().await.unwrap();
        driver.connect().await.unwrap();
        assert_eq!(driver.get(b"k").await.unwrap(), Some(Bytes::from("v")));

        drop(in_flight);
        driver.close().await.unwrap();
        driver.connect().await.unwrap();
        assert_eq!(driver.get(b"k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn zero_ttl_at_epoch_expires() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(0);
        let driver = open_driver(&dir, &clock).await;

        driver.put_with_ttl(b"k", b"v", Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(10));
        assert!(driver.get(b"k").await.unwrap().is_none());
    }
}
