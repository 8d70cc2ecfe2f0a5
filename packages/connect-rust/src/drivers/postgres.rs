//! `PostgreSQL` [`BackendDriver`] storing one row per key.
//!
//! Schema: `key BYTEA PRIMARY KEY, value BYTEA NOT NULL, expires_at BIGINT`,
//! where `expires_at` is absolute millis since epoch and `NULL` never expires.
//! Expired rows are filtered at read time and overwritten by later writes.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use keyway_core::clock::{expires_at, ClockSource, SystemClock};
use parking_lot::RwLock;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::config::PostgresConfig;
use crate::traits::{BackendDriver, CasOutcome};

pub struct PostgresDriver {
    config: PostgresConfig,
    pool: RwLock<Option<PgPool>>,
    clock: Arc<dyn ClockSource>,
}

fn to_db_millis(millis: u64) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX)
}

fn validate_table_name(name: &str) -> anyhow::Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        anyhow::bail!("invalid table name {name:?}: use letters, digits and underscores")
    }
}

impl PostgresDriver {
    /// Validates the table name up front; it is interpolated into SQL.
    pub fn new(config: PostgresConfig) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PostgresConfig, clock: Arc<dyn ClockSource>) -> anyhow::Result<Self> {
        validate_table_name(&config.table)?;
        Ok(Self {
            config,
            pool: RwLock::new(None),
            clock,
        })
    }

    fn pool(&self) -> anyhow::Result<PgPool> {
        self.pool
            .read()
            .clone()
            .context("postgres driver is not connected")
    }

    fn now(&self) -> i64 {
        to_db_millis(self.clock.now())
    }

    fn deadline(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| to_db_millis(expires_at(self.clock.now(), ttl)))
    }

    async fn upsert(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> anyhow::Result<()> {
        let sql = format!(
            "INSERT INTO {t} (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
            t = self.config.table
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(self.deadline(ttl))
            .execute(&self.pool()?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BackendDriver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> anyhow::Result<()> {
        if self.pool.read().is_some() {
            return Ok(());
        }

        let mut options = PgConnectOptions::from_str(&self.config.url)
            .context("invalid postgres connection url")?;
        if let Some(username) = &self.config.username {
            options = options.username(username);
        }
        if let Some(password) = &self.config.password {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections.max(1))
            .connect_with(options)
            .await
            .context("failed to connect to postgres")?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (key BYTEA PRIMARY KEY, value BYTEA NOT NULL, expires_at BIGINT)",
            self.config.table
        );
        sqlx::query(&ddl).execute(&pool).await?;

        info!(table = %self.config.table, "postgres pool established");
        *self.pool.write() = Some(pool);
        Ok(())
    }

    async fn ready(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool()?).await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!("postgres pool closed");
        }
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> anyhow::Result<Option<Bytes>> {
        let sql = format!(
            "SELECT value FROM {} WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)",
            self.config.table
        );
        let value: Option<Vec<u8>> = sqlx::query_scalar(&sql)
            .bind(key)
            .bind(self.now())
            .fetch_optional(&self.pool()?)
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.upsert(key, value, None).await
    }

    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        self.upsert(key, value, Some(ttl)).await
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> anyhow::Result<CasOutcome> {
        let pool = self.pool()?;
        let t = &self.config.table;
        let now = self.now();

        let result = match expected {
            // Insert, or take over a row whose value has expired.
            None => {
                let sql = format!(
                    "INSERT INTO {t} (key, value, expires_at) VALUES ($1, $2, $3) \
                     ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at \
                     WHERE {t}.expires_at IS NOT NULL AND {t}.expires_at <= $4"
                );
                sqlx::query(&sql)
                    .bind(key)
                    .bind(new)
                    .bind(self.deadline(ttl))
                    .bind(now)
                    .execute(&pool)
                    .await?
            }
            Some(old) => {
                let sql = format!(
                    "UPDATE {t} SET value = $2, expires_at = $3 \
                     WHERE key = $1 AND value = $4 AND (expires_at IS NULL OR expires_at > $5)"
                );
                sqlx::query(&sql)
                    .bind(key)
                    .bind(new)
                    .bind(self.deadline(ttl))
                    .bind(old)
                    .bind(now)
                    .execute(&pool)
                    .await?
            }
        };

        if result.rows_affected() == 1 {
            return Ok(CasOutcome {
                previous: expected.map(Bytes::copy_from_slice),
                swapped: true,
            });
        }
        // Lost the swap; the current value is read separately and may be newer.
        Ok(CasOutcome {
            previous: self.get(key).await?,
            swapped: false,
        })
    }

    async fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let sql = format!("DELETE FROM {} WHERE key = $1", self.config.table);
        sqlx::query(&sql).bind(key).execute(&self.pool()?).await?;
        Ok(())
    }

    async fn batch_get(&self, keys: &[Bytes]) -> anyhow::Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT key, value FROM {} WHERE key = ANY($1) AND (expires_at IS NULL OR expires_at > $2)",
            self.config.table
        );
        let wanted: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(&sql)
            .bind(&wanted)
            .bind(self.now())
            .fetch_all(&self.pool()?)
            .await?;

        let found: HashMap<Vec<u8>, Bytes> = rows
            .into_iter()
            .map(|(k, v)| (k, Bytes::from(v)))
            .collect();
        Ok(keys.iter().map(|k| found.get(k.as_ref()).cloned()).collect())
    }

    async fn batch_put(&self, pairs: &[(Bytes, Bytes)]) -> anyhow::Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        // A single upsert may not touch the same key twice; the last write wins.
        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(pairs.len());
        let mut values = Vec::with_capacity(pairs.len());
        for (key, value) in pairs.iter().rev() {
            if seen.insert(key.clone()) {
                keys.push(key.to_vec());
                values.push(value.to_vec());
            }
        }

        let sql = format!(
            "INSERT INTO {t} (key, value, expires_at) \
             SELECT k, v, NULL FROM UNNEST($1::bytea[], $2::bytea[]) AS src(k, v) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
            t = self.config.table
        );
        sqlx::query(&sql)
            .bind(&keys)
            .bind(&values)
            .execute(&self.pool()?)
            .await?;
        Ok(())
    }

    async fn batch_delete(&self, keys: &[Bytes]) -> anyhow::Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let sql = format!("DELETE FROM {} WHERE key = ANY($1)", self.config.table);
        let keys: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        sqlx::query(&sql).bind(&keys).execute(&self.pool()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keyway_core::ManualClock;

    use super::*;

    /// Connects to the database named by `KEYWAY_TEST_POSTGRES_URL`, or
    /// returns `None` so the test is skipped.
    async fn test_driver(table: &str, clock: &ManualClock) -> Option<PostgresDriver> {
        let url = std::env::var("KEYWAY_TEST_POSTGRES_URL").ok()?;
        let config = PostgresConfig {
            url,
            table: table.to_string(),
            username: None,
            password: None,
            max_connections: 2,
        };
        let driver = PostgresDriver::with_clock(config, Arc::new(clock.clone())).unwrap();
        driver.connect().await.unwrap();
        let truncate = format!("TRUNCATE {table}");
        sqlx::query(&truncate)
            .execute(&driver.pool().unwrap())
            .await
            .unwrap();
        Some(driver)
    }

    #[test]
    fn rejects_unsafe_table_names() {
        for name in ["", "kv; DROP TABLE x", "1kv", "kv-store"] {
            assert!(validate_table_name(name).is_err(), "{name:?} accepted");
        }
        validate_table_name("keyway_kv").unwrap();
    }

    #[test]
    fn db_millis_saturate() {
        assert_eq!(to_db_millis(u64::MAX), i64::MAX);
        assert_eq!(to_db_millis(42), 42);
    }

    #[tokio::test]
    async fn calls_before_connect_fail() {
        let driver = PostgresDriver::new(PostgresConfig {
            url: "postgres://localhost/none".to_string(),
            table: "keyway_kv".to_string(),
            username: None,
            password: None,
            max_connections: 1,
        })
        .unwrap();
        assert!(driver.get(b"k").await.is_err());
    }

    #[tokio::test]
    async fn round_trip_and_ttl() {
        let clock = ManualClock::new(1_000);
        let Some(driver) = test_driver("keyway_test_round_trip", &clock).await else {
            return;
        };

        driver.put(b"k", b"v").await.unwrap();
        assert_eq!(driver.get(b"k").await.unwrap(), Some(Bytes::from("v")));

        driver
            .put_with_ttl(b"t", b"v", Duration::from_millis(100))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(100));
        assert!(driver.get(b"t").await.unwrap().is_none());

        driver.delete(b"k").await.unwrap();
        assert!(driver.get(b"k").await.unwrap().is_none());
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn cas_and_batches() {
        let clock = ManualClock::new(1_000);
        let Some(driver) = test_driver("keyway_test_cas", &clock).await else {
            return;
        };

        assert!(driver.compare_and_swap(b"k", None, b"1", None).await.unwrap().swapped);
        let lost = driver.compare_and_swap(b"k", None, b"2", None).await.unwrap();
        assert!(!lost.swapped);
        assert_eq!(lost.previous, Some(Bytes::from("1")));

        driver
            .batch_put(&[
                (Bytes::from("a"), Bytes::from("x")),
                (Bytes::from("a"), Bytes::from("y")),
            ])
            .await
            .unwrap();
        let out = driver
            .batch_get(&[Bytes::from("a"), Bytes::from("missing")])
            .await
            .unwrap();
        assert_eq!(out, vec![Some(Bytes::from("y")), None]);
        driver.close().await.unwrap();
    }
}
