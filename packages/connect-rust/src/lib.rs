//! Keyway connectors: backend drivers, connection lifecycle, the cache
//! contract, the batch processor and writer, and the channel stream writer.

pub mod cache;
pub mod config;
pub mod connection;
pub mod drivers;
mod instrument;
pub mod output;
pub mod processor;
pub mod stream;
pub mod traits;

pub use cache::CacheAdapter;
pub use config::{CacheConfig, ClientConfig, PostgresConfig, ProcessorConfig, ReadinessPolicy, RedbConfig, StreamConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use output::BatchWriter;
pub use processor::{BatchProcessor, Operation};
pub use stream::{ChannelSession, StreamWriter};
pub use traits::{BackendDriver, CasOutcome};
