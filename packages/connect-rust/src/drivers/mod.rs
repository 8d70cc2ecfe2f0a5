//! [`BackendDriver`](crate::traits::BackendDriver) implementations.
//!
//! [`MemoryDriver`] is always available. The embedded [`RedbDriver`] sits
//! behind the `redb` feature (on by default) and [`PostgresDriver`] behind
//! `postgres`.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redb")]
mod record;
#[cfg(feature = "redb")]
mod redb;

pub use memory::MemoryDriver;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;
#[cfg(feature = "redb")]
pub use self::redb::RedbDriver;
