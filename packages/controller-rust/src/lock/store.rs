use std::time::Duration;

use async_trait::async_trait;

/// A live lock: who holds it and when it expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub holder: String,
    /// Expiry as milliseconds since Unix epoch.
    pub expires_at_ms: u64,
}

/// Lock store failures. Callers treat every variant as "could not
/// determine", never as "locked" or "unlocked".
#[derive(Debug, thiserror::Error)]
pub enum LockStoreError {
    #[error("lock bucket {0} does not exist")]
    MissingBucket(String),
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
    #[cfg(feature = "postgres")]
    #[error("lock store database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One bucket of TTL lock records.
///
/// At most one live record exists per key. Records disappear on explicit
/// [`release`](LockStore::release) or once their TTL elapses, whichever
/// comes first. There is no renewal.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Name of the bucket.
    fn bucket(&self) -> &str;

    /// TTL applied to newly acquired records.
    fn ttl(&self) -> Duration;

    /// Confirms the bucket is reachable. Called once at startup.
    async fn verify(&self) -> Result<(), LockStoreError> {
        Ok(())
    }

    /// Atomically creates a record for `key` if no live record exists.
    /// Returns `false` when someone else holds it.
    async fn try_acquire(&self, key: &str, holder: &str) -> Result<bool, LockStoreError>;

    /// Non-destructive check for a live record.
    async fn is_locked(&self, key: &str) -> Result<bool, LockStoreError>;

    /// Deletes the record for `key`. Returns `false` when there was no live
    /// record, e.g. because the TTL already expired it.
    async fn release(&self, key: &str) -> Result<bool, LockStoreError>;

    /// The live record for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<LockRecord>, LockStoreError>;
}
