//! Process-wide shutdown coordination.
//!
//! [`ShutdownController`] owns the health state machine, the shutdown
//! broadcast, and two RAII-tracked counters: running dispatcher workers and
//! in-flight reconcile tasks. A draining process waits for both to reach
//! zero before reporting `Stopped`.

mod signals;
mod watcher;

pub use signals::spawn_signal_listener;
pub use watcher::{Settlement, TaskWatch, WatchOutcome};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Process health state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Workers are being set up.
    Starting,
    /// Workers are pulling notifications.
    Ready,
    /// Shutdown was triggered; workers finish their current task and exit.
    Draining,
    /// Every worker has exited.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates graceful shutdown across every worker pool in the process.
///
/// 1. Health probes read `health_state()`.
/// 2. Dispatchers and task watchers hold a `shutdown_receiver()`.
/// 3. `trigger_shutdown()` moves to Draining and signals every receiver.
/// 4. `wait_for_drain()` blocks until workers and tasks have finished.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    workers: Arc<AtomicU64>,
    health_state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    /// Creates a new shutdown controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            workers: Arc::new(AtomicU64::new(0)),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    /// Transitions to `Ready`. Has no effect once shutdown was triggered.
    pub fn set_ready(&self) {
        if !self.is_shutting_down() {
            self.health_state.store(Arc::new(HealthState::Ready));
        }
    }

    /// Returns a receiver that observes `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Initiates graceful shutdown. Idempotent.
    pub fn trigger_shutdown(&self) {
        if self.shutdown_signal.send_replace(true) {
            return;
        }
        self.health_state.store(Arc::new(HealthState::Draining));
        tracing::info!("shutdown triggered");
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Returns a shared handle to the health state for handlers.
    #[must_use]
    pub fn health_state_handle(&self) -> Arc<ArcSwap<HealthState>> {
        Arc::clone(&self.health_state)
    }

    /// Tracks one reconcile task until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Tracks one running dispatcher until the guard is dropped. Dropping
    /// the guard is the dispatcher's completion signal.
    #[must_use]
    pub fn worker_guard(&self) -> WorkerGuard {
        self.workers.fetch_add(1, Ordering::AcqRel);
        WorkerGuard {
            workers: Arc::clone(&self.workers),
        }
    }

    #[must_use]
    pub fn active_workers(&self) -> u64 {
        self.workers.load(Ordering::Acquire)
    }

    /// Waits until every worker has exited and no task is in flight, up to
    /// `timeout`.
    ///
    /// Returns `true` and transitions to `Stopped` on success. Returns
    /// `false` if the timeout expired (state remains `Draining`).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.active_workers() == 0 && self.in_flight_count() == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    workers = self.active_workers(),
                    in_flight = self.in_flight_count(),
                    "drain timed out"
                );
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` observes a triggered shutdown, or its controller is
/// gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // A dropped sender yields Err, which also ends the wait.
    let _ = rx.wait_for(|triggered| *triggered).await;
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// RAII guard that decrements the active worker counter when dropped.
#[derive(Debug)]
pub struct WorkerGuard {
    workers: Arc<AtomicU64>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.workers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_starting() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        assert_eq!(controller.in_flight_count(), 0);
        assert_eq!(controller.active_workers(), 0);
        assert!(!controller.is_shutting_down());
    }

    #[test]
    fn health_state_transitions_starting_ready_draining() {
        let controller = ShutdownController::new();
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn set_ready_after_shutdown_keeps_draining() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Draining);
    }

    #[test]
    fn health_state_names() {
        assert_eq!(HealthState::Starting.as_str(), "starting");
        assert_eq!(HealthState::Ready.as_str(), "ready");
        assert_eq!(HealthState::Draining.as_str(), "draining");
        assert_eq!(HealthState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn guards_increment_and_decrement() {
        let controller = ShutdownController::new();

        let task = controller.in_flight_guard();
        let worker1 = controller.worker_guard();
        let worker2 = controller.worker_guard();
        assert_eq!(controller.in_flight_count(), 1);
        assert_eq!(controller.active_workers(), 2);

        drop(task);
        drop(worker1);
        assert_eq!(controller.in_flight_count(), 0);
        assert_eq!(controller.active_workers(), 1);

        drop(worker2);
        assert_eq!(controller.active_workers(), 0);
    }

    #[tokio::test]
    async fn shutdown_receiver_notified() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        controller.trigger_shutdown();
        wait_for_shutdown(&mut rx).await;
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_for_shutdown_returns_when_controller_dropped() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        drop(controller);
        wait_for_shutdown(&mut rx).await;
    }

    #[tokio::test]
    async fn wait_for_drain_immediate_success() {
        let controller = ShutdownController::new();
        controller.set_ready();
        controller.trigger_shutdown();

        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn wait_for_drain_waits_for_workers() {
        let controller = ShutdownController::new();
        controller.set_ready();

        let worker = controller.worker_guard();
        controller.trigger_shutdown();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(worker);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_timeout() {
        let controller = ShutdownController::new();
        controller.set_ready();

        let _task = controller.in_flight_guard();
        controller.trigger_shutdown();

        let drained = controller.wait_for_drain(Duration::from_millis(50)).await;
        assert!(!drained);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }

    #[test]
    fn health_state_handle_shares_state() {
        let controller = ShutdownController::new();
        let handle = controller.health_state_handle();
        assert_eq!(**handle.load(), HealthState::Starting);

        controller.set_ready();
        assert_eq!(**handle.load(), HealthState::Ready);
    }
}
