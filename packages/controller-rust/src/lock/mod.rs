//! TTL-keyed mutual exclusion across controller processes.
//!
//! - [`LockStore`]: one bucket of TTL lock records with atomic
//!   create-if-absent acquisition
//! - [`MemoryLockStore`]: in-process store backed by `DashMap`
//! - [`PgLockStore`] (feature `postgres`): shared store in a Postgres table
//! - [`LockBucket`]: per-kind adapter that derives keys and holder identity

pub mod bucket;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use bucket::LockBucket;
pub use memory::MemoryLockStore;
#[cfg(feature = "postgres")]
pub use postgres::PgLockStore;
pub use store::{LockRecord, LockStore, LockStoreError};
