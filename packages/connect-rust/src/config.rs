//! Resolved configuration for connectors.
//!
//! Parsing, validation rules and documentation of user-facing config files are
//! the embedding pipeline's job; these structs are what it hands over.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Settings shared by every driver-backed connector.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline applied to each backend call when the caller sets none.
    pub request_timeout_ms: u64,
    /// Readiness wait performed on connect.
    pub readiness: ReadinessPolicy,
}

impl ClientConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            readiness: ReadinessPolicy::default(),
        }
    }
}

/// Bounded readiness wait: a fixed number of probes with a fixed pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Number of readiness probes before giving up. Treated as at least 1.
    pub attempts: u32,
    /// Pause between failed probes.
    pub interval_ms: u64,
}

impl ReadinessPolicy {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_ms: 1_000,
        }
    }
}

/// Cache adapter settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when a call passes none. `None` means no expiry.
    pub default_ttl_ms: Option<u64>,
}

impl CacheConfig {
    #[must_use]
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }
}

/// Batch processor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// One of `get`, `delete`, `put`.
    pub operation: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            operation: "get".to_string(),
        }
    }
}

/// Embedded `redb` store location.
#[derive(Debug, Clone, Deserialize)]
pub struct RedbConfig {
    /// Database file; created on first connect if missing.
    pub path: PathBuf,
}

/// `PostgreSQL` document-table backend.
///
/// No `Default` impl because the connection URL has no sensible default.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    /// Connection URL, e.g. `postgres://localhost/keyway`.
    pub url: String,
    /// Table holding the documents. Created on connect if missing.
    #[serde(default = "default_pg_table")]
    pub table: String,
    /// Overrides the user in `url` when set.
    #[serde(default)]
    pub username: Option<String>,
    /// Overrides the password in `url` when set.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pg_max_connections")]
    pub max_connections: u32,
}

fn default_pg_table() -> String {
    "keyway_kv".to_string()
}

fn default_pg_max_connections() -> u32 {
    8
}

/// Channel-based ingestion endpoint.
///
/// No `Default` impl because account identity and key material are required.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Account name (without region or cloud segments).
    pub account: String,
    /// Region segment of an account-locator identifier.
    #[serde(default)]
    pub region: Option<String>,
    /// Cloud segment of an account-locator identifier.
    #[serde(default)]
    pub cloud: Option<String>,
    pub user: String,
    pub role: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub channel: String,
    /// PEM file holding the RSA signing key (PKCS#1, PKCS#8 or encrypted PKCS#8).
    pub private_key_file: PathBuf,
    /// Passphrase for an encrypted key.
    #[serde(default)]
    pub private_key_pass: Option<String>,
    /// Base URL override. Defaults to `https://<account identifier>.snowflakecomputing.com`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_stream_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_stream_timeout_ms() -> u64 {
    30_000
}

impl StreamConfig {
    /// `account[.region][.cloud]`, the host label of the ingestion endpoint.
    #[must_use]
    pub fn account_identifier(&self) -> String {
        let mut id = self.account.clone();
        for segment in [&self.region, &self.cloud].into_iter().flatten() {
            id.push('.');
            id.push_str(segment);
        }
        id
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        self.endpoint.clone().unwrap_or_else(|| {
            format!("https://{}.snowflakecomputing.com", self.account_identifier())
        })
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
