//! Worker pool: N dispatchers of one object type running concurrently.

use reconcile_core::Resource;
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// Handles to the spawned dispatchers of one object type.
///
/// Dispatchers stop on their own once shutdown is triggered; `join` waits
/// for them.
#[derive(Debug)]
pub struct WorkerPool {
    kind: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns every dispatcher onto the runtime.
    #[must_use]
    pub fn start<T: Resource>(dispatchers: Vec<Dispatcher<T>>) -> Self {
        let handles = dispatchers
            .into_iter()
            .map(|dispatcher| tokio::spawn(dispatcher.run()))
            .collect::<Vec<_>>();
        tracing::info!(kind = T::KIND, workers = handles.len(), "worker pool started");
        Self {
            kind: T::KIND,
            handles,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every dispatcher to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(kind = self.kind, error = %err, "dispatcher task failed");
            }
        }
        tracing::info!(kind = self.kind, "worker pool stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
