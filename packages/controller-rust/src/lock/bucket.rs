use std::sync::Arc;

use reconcile_core::lock_key;
use tracing::debug;

use super::store::{LockStore, LockStoreError};

/// Lock operations for one object kind on behalf of one holder.
///
/// Keys are `<kind>.<id>` so several controller types can share a bucket.
#[derive(Clone)]
pub struct LockBucket {
    store: Arc<dyn LockStore>,
    kind: String,
    holder: String,
}

impl LockBucket {
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>, kind: &str, holder: impl Into<String>) -> Self {
        Self {
            store,
            kind: kind.to_ascii_lowercase(),
            holder: holder.into(),
        }
    }

    /// Key under which `id` is locked.
    #[must_use]
    pub fn key(&self, id: &str) -> String {
        lock_key(&self.kind, id)
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// # Errors
    ///
    /// Returns the store error when the outcome could not be determined.
    pub async fn try_acquire(&self, id: &str) -> Result<bool, LockStoreError> {
        let key = self.key(id);
        let acquired = self.store.try_acquire(&key, &self.holder).await?;
        debug!(bucket = self.store.bucket(), key = %key, acquired, "lock acquire");
        Ok(acquired)
    }

    /// # Errors
    ///
    /// Returns the store error when the outcome could not be determined.
    pub async fn is_locked(&self, id: &str) -> Result<bool, LockStoreError> {
        self.store.is_locked(&self.key(id)).await
    }

    /// Releases the lock for `id`. `Ok(false)` means the TTL already
    /// expired it, which is an expected race.
    ///
    /// # Errors
    ///
    /// Returns the store error when the record could not be deleted.
    pub async fn release(&self, id: &str) -> Result<bool, LockStoreError> {
        let key = self.key(id);
        let released = self.store.release(&key).await?;
        if !released {
            debug!(bucket = self.store.bucket(), key = %key, "lock already expired at release");
        }
        Ok(released)
    }
}

impl std::fmt::Debug for LockBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockBucket")
            .field("bucket", &self.store.bucket())
            .field("kind", &self.kind)
            .field("holder", &self.holder)
            .finish()
    }
}
