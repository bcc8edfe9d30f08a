//! In-memory [`LockStore`] backed by [`DashMap`].
//!
//! `DashMap`'s entry API gives per-key atomic create-if-absent without an
//! external mutex, so concurrent acquirers in the same process never both
//! win. Expiry is evaluated lazily against the injected [`ClockSource`];
//! records left behind by holders that never released are swept every
//! [`SWEEP_EVERY`] acquisitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reconcile_core::{ClockSource, SystemClock};

use super::store::{LockRecord, LockStore, LockStoreError};

/// Acquisitions between sweeps of expired records.
pub const SWEEP_EVERY: u64 = 256;

/// Process-local TTL lock bucket.
pub struct MemoryLockStore {
    bucket: String,
    ttl: Duration,
    entries: DashMap<String, LockRecord>,
    clock: Arc<dyn ClockSource>,
    acquisitions: AtomicU64,
}

impl MemoryLockStore {
    /// Creates an empty bucket reading the system clock.
    #[must_use]
    pub fn new(bucket: impl Into<String>, ttl: Duration) -> Self {
        Self::with_clock(bucket, ttl, Arc::new(SystemClock))
    }

    /// Creates an empty bucket reading `clock`.
    #[must_use]
    pub fn with_clock(bucket: impl Into<String>, ttl: Duration, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            bucket: bucket.into(),
            ttl,
            entries: DashMap::new(),
            clock,
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Removes every expired record and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, record| record.expires_at_ms > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored records, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expires_at(&self, now_ms: u64) -> u64 {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        now_ms.saturating_add(ttl_ms)
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn try_acquire(&self, key: &str, holder: &str) -> Result<bool, LockStoreError> {
        // Must run before `entry` takes a shard lock that `retain` would need.
        if self.acquisitions.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(bucket = %self.bucket, purged, "swept expired locks");
            }
        }

        let now = self.clock.now_ms();
        let record = LockRecord {
            holder: holder.to_string(),
            expires_at_ms: self.expires_at(now),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at_ms > now {
                    return Ok(false);
                }
                // Expired record: the previous holder crashed or overran its TTL.
                occupied.insert(record);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(true)
            }
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockStoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .is_some_and(|record| record.expires_at_ms > now))
    }

    async fn release(&self, key: &str) -> Result<bool, LockStoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, record)| record.expires_at_ms > now))
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, LockStoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|record| record.expires_at_ms > now)
            .map(|record| record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use reconcile_core::ManualClock;

    use super::*;

    const TTL: Duration = Duration::from_secs(20 * 60);

    fn store_with_clock() -> (Arc<MemoryLockStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryLockStore::with_clock("locks", TTL, clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let (store, _clock) = store_with_clock();

        assert!(store.try_acquire("network.7", "a").await.unwrap());
        assert!(!store.try_acquire("network.7", "b").await.unwrap());
        assert!(store.is_locked("network.7").await.unwrap());
        assert_eq!(store.get("network.7").await.unwrap().unwrap().holder, "a");

        assert!(store.release("network.7").await.unwrap());
        assert!(!store.is_locked("network.7").await.unwrap());
        assert!(store.try_acquire("network.7", "b").await.unwrap());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (store, _clock) = store_with_clock();
        assert!(store.try_acquire("network.1", "a").await.unwrap());
        assert!(store.try_acquire("network.2", "b").await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn crashed_holder_lock_expires_after_ttl_and_not_before() {
        let (store, clock) = store_with_clock();
        assert!(store.try_acquire("network.7", "crashed").await.unwrap());

        clock.advance(TTL - Duration::from_millis(1));
        assert!(store.is_locked("network.7").await.unwrap());
        assert!(!store.try_acquire("network.7", "next").await.unwrap());

        clock.advance(Duration::from_millis(1));
        assert!(!store.is_locked("network.7").await.unwrap());
        assert!(store.try_acquire("network.7", "next").await.unwrap());
        assert_eq!(store.get("network.7").await.unwrap().unwrap().holder, "next");
    }

    #[tokio::test]
    async fn release_after_expiry_reports_false() {
        let (store, clock) = store_with_clock();
        assert!(store.try_acquire("network.7", "a").await.unwrap());

        clock.advance(TTL);
        assert!(!store.release("network.7").await.unwrap());
        assert!(!store.release("network.7").await.unwrap());
    }

    #[tokio::test]
    async fn purge_drops_only_expired_records() {
        let (store, clock) = store_with_clock();
        store.try_acquire("old", "a").await.unwrap();
        clock.advance(TTL / 2);
        store.try_acquire("young", "b").await.unwrap();
        clock.advance(TTL / 2);

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.is_locked("young").await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_records_are_swept_by_later_acquisitions() {
        let (store, clock) = store_with_clock();
        assert!(store.try_acquire("network.abandoned", "crashed").await.unwrap());
        clock.advance(TTL);

        // Distinct keys, so the abandoned record is never taken over.
        for i in 1..SWEEP_EVERY - 1 {
            assert!(store.try_acquire(&format!("volume.{i}"), "a").await.unwrap());
            assert!(store.release(&format!("volume.{i}")).await.unwrap());
        }
        assert_eq!(store.len(), 1);

        assert!(store.try_acquire("volume.last", "a").await.unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.get("network.abandoned").await.unwrap().is_none());
        assert!(store.is_locked("volume.last").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquirers_have_one_winner() {
        let (store, _clock) = store_with_clock();
        let winners = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            let winners = Arc::clone(&winners);
            handles.push(tokio::spawn(async move {
                if store.try_acquire("network.15", &format!("holder-{i}")).await.unwrap() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
