//! Per-task shutdown watcher.
//!
//! Each reconcile task spawns a [`TaskWatch`] that races the process
//! shutdown signal against the task's own "done" signal. If shutdown wins,
//! the watcher runs the task's cancel action (unlock and requeue) on the
//! task's behalf. [`Settlement`] decides which of the two paths gets to
//! settle the message.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::wait_for_shutdown;

/// Which branch of the race fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The task signalled completion first.
    Finished,
    /// Shutdown arrived first and the cancel action ran.
    Cancelled,
}

/// Handle to a running watcher.
#[derive(Debug)]
pub struct TaskWatch {
    done: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<WatchOutcome>>,
}

impl TaskWatch {
    /// Spawns the watcher. `on_cancel` runs only if shutdown is observed
    /// before [`TaskWatch::finish`] is called or the handle is dropped.
    pub fn spawn<F, Fut>(mut shutdown: watch::Receiver<bool>, on_cancel: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = done_rx => WatchOutcome::Finished,
                () = wait_for_shutdown(&mut shutdown) => {
                    on_cancel().await;
                    WatchOutcome::Cancelled
                }
            }
        });

        Self {
            done: Some(done_tx),
            handle: Some(handle),
        }
    }

    /// Signals completion and waits for the watcher to exit. If shutdown
    /// already won the race, this waits for the cancel action to finish.
    pub async fn finish(mut self) -> WatchOutcome {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|err| {
                tracing::warn!(error = %err, "task watcher did not complete");
                WatchOutcome::Cancelled
            }),
            None => WatchOutcome::Finished,
        }
    }
}

impl Drop for TaskWatch {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// One-shot claim on settling a delivered message.
#[derive(Debug, Default)]
pub struct Settlement {
    settled: AtomicBool,
}

impl Settlement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for exactly one caller.
    pub fn try_settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::shutdown::ShutdownController;

    fn counting_cancel(
        counter: &Arc<AtomicU32>,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn finish_before_shutdown_skips_cancel() {
        let controller = ShutdownController::new();
        let cancels = Arc::new(AtomicU32::new(0));
        let watch = TaskWatch::spawn(controller.shutdown_receiver(), counting_cancel(&cancels));

        assert_eq!(watch.finish().await, WatchOutcome::Finished);
        controller.trigger_shutdown();
        tokio::task::yield_now().await;
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_runs_cancel_action() {
        let controller = ShutdownController::new();
        let cancels = Arc::new(AtomicU32::new(0));
        let watch = TaskWatch::spawn(controller.shutdown_receiver(), counting_cancel(&cancels));

        controller.trigger_shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(watch.finish().await, WatchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn finish_waits_for_slow_cancel_action() {
        let controller = ShutdownController::new();
        let cancels = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&cancels);
        let watch = TaskWatch::spawn(controller.shutdown_receiver(), move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });

        controller.trigger_shutdown();
        tokio::task::yield_now().await;
        assert_eq!(watch.finish().await, WatchOutcome::Cancelled);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_watch_never_cancels() {
        let controller = ShutdownController::new();
        let cancels = Arc::new(AtomicU32::new(0));
        drop(TaskWatch::spawn(
            controller.shutdown_receiver(),
            counting_cancel(&cancels),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.trigger_shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn settlement_is_claimed_once() {
        let settlement = Settlement::new();
        assert!(!settlement.is_settled());
        assert!(settlement.try_settle());
        assert!(!settlement.try_settle());
        assert!(settlement.is_settled());
    }
}
