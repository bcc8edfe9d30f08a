//! Reconcile dispatcher: the per-object-type state machine.
//!
//! One [`Dispatcher`] pulls from its subscription handle and processes one
//! delivery at a time:
//!
//! 1. stop if shutdown was triggered
//! 2. pull (bounded by the poll interval)
//! 3. decode; undecodable payloads are redelivered unchanged
//! 4. check the object's lock; contention or a store error requeues
//! 5. start the task watcher that unlocks and requeues on shutdown
//! 6. acquire the lock; losing the race requeues
//! 7. fetch the current object (not for deletes); not-found drops the task
//! 8. run the operation's handler
//! 9. mark created/updated objects reconciled
//! 10. release the lock and acknowledge
//!
//! Every failure after decoding funnels into unlock-and-requeue with the
//! backoff delay. Each delivery is settled (acked or requeued) exactly once,
//! either here or by the watcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reconcile_core::{ClockSource, Notification, NotificationCodec, Operation, RequeuePolicy, Resource};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{BrokerError, Delivery, Subscription};
use crate::error::ReconcileError;
use crate::lock::LockBucket;
use crate::shutdown::{wait_for_shutdown, Settlement, ShutdownController, TaskWatch, WorkerGuard};
use crate::traits::{ApiClient, ObjectPatch, Reconciler};

/// Pause after a failed pull before trying again.
const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// TaskOutcome
// ---------------------------------------------------------------------------

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Handled, lock released, delivery acked.
    Completed,
    /// The object no longer exists; lock released, delivery acked.
    Dropped,
    /// Redelivery scheduled after `delay`.
    Requeued {
        reason: &'static str,
        delay: Duration,
    },
    /// Shutdown arrived mid-task and the watcher settled the delivery.
    Interrupted,
}

impl TaskOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Dropped => "dropped",
            Self::Requeued { .. } => "requeued",
            Self::Interrupted => "interrupted",
        }
    }
}

// ---------------------------------------------------------------------------
// DispatcherContext
// ---------------------------------------------------------------------------

/// Collaborators shared by every dispatcher of one object type.
pub struct DispatcherContext<T: Resource> {
    pub codec: NotificationCodec,
    pub requeue: RequeuePolicy,
    pub poll_interval: Duration,
    pub poison_redelivery_delay: Duration,
    pub locks: LockBucket,
    pub api: Arc<dyn ApiClient<T>>,
    pub reconciler: Arc<dyn Reconciler<T>>,
    pub clock: Arc<dyn ClockSource>,
    pub shutdown: Arc<ShutdownController>,
}

impl<T: Resource> DispatcherContext<T> {
    /// Backoff delay for `notification` and the payload that carries it.
    ///
    /// The redelivered notification keeps its operation and snapshot, sets
    /// `requeue`, and accumulates the delay into `lastRequeueDelay`. If it
    /// cannot be re-encoded the original payload is reused.
    fn requeue_plan(&self, notification: &Notification<T>, original: &Bytes) -> (Duration, Bytes) {
        let elapsed_secs = notification.elapsed_backoff_secs();
        let now_ms = self.clock.now_ms();
        let first_seen_ms = now_ms.saturating_sub(elapsed_secs.saturating_mul(1000));
        let delay = self.requeue.next_delay(first_seen_ms, now_ms);

        let cumulative = i64::try_from(elapsed_secs.saturating_add(delay.as_secs())).unwrap_or(i64::MAX);
        let payload = self
            .codec
            .encode(&notification.operation, Some(true), cumulative, &notification.object)
            .map_or_else(
                |err| {
                    warn!(error = %err, "could not re-encode notification, requeueing original payload");
                    original.clone()
                },
                Bytes::from,
            );
        (delay, payload)
    }
}

// ---------------------------------------------------------------------------
// ReconcileTask
// ---------------------------------------------------------------------------

/// In-flight state of one delivery, shared with its watcher.
struct ReconcileTask {
    subscription: Arc<dyn Subscription>,
    locks: LockBucket,
    delivery: Delivery,
    object_id: String,
    requeue_payload: Bytes,
    delay: Duration,
    settlement: Settlement,
    lock_held: AtomicBool,
}

impl ReconcileTask {
    fn mark_locked(&self) {
        self.lock_held.store(true, Ordering::SeqCst);
    }

    /// Releases the lock if this task still holds it. Runs at most once.
    async fn release_lock(&self) {
        if !self.lock_held.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.locks.release(&self.object_id).await {
            warn!(object_id = %self.object_id, error = %err, "lock release failed, waiting for TTL expiry");
        }
    }

    /// Unlocks and schedules redelivery. Returns `false` if the delivery was
    /// already settled elsewhere.
    async fn unlock_and_requeue(&self) -> bool {
        if !self.settlement.try_settle() {
            return false;
        }
        self.release_lock().await;
        if let Err(err) = self
            .subscription
            .requeue(&self.delivery, self.requeue_payload.clone(), self.delay)
            .await
        {
            let err = ReconcileError::from(err);
            error!(
                object_id = %self.object_id,
                reason = err.label(),
                error = %err,
                "requeue failed, relying on broker redelivery"
            );
        }
        true
    }

    /// Unlocks and acknowledges. Returns `false` if the delivery was already
    /// settled elsewhere.
    async fn release_and_ack(&self) -> bool {
        if !self.settlement.try_settle() {
            return false;
        }
        self.release_lock().await;
        if let Err(err) = self.subscription.ack(&self.delivery).await {
            let err = ReconcileError::from(err);
            error!(object_id = %self.object_id, reason = err.label(), error = %err, "ack failed");
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// One worker of an object type's pool.
pub struct Dispatcher<T: Resource> {
    worker: usize,
    ctx: Arc<DispatcherContext<T>>,
    subscription: Arc<dyn Subscription>,
    _running: WorkerGuard,
}

impl<T: Resource> Dispatcher<T> {
    /// The dispatcher counts as a running worker of `ctx.shutdown` from
    /// construction until it is dropped.
    #[must_use]
    pub fn new(worker: usize, ctx: Arc<DispatcherContext<T>>, subscription: Arc<dyn Subscription>) -> Self {
        let running = ctx.shutdown.worker_guard();
        Self {
            worker,
            ctx,
            subscription,
            _running: running,
        }
    }

    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Runs until shutdown or until the subscription closes, then
    /// unsubscribes. Dropping `self` at the end is the completion signal.
    pub async fn run(self) {
        let shutdown = Arc::clone(&self.ctx.shutdown);
        let mut shutdown_rx = shutdown.shutdown_receiver();
        info!(kind = T::KIND, worker = self.worker, "dispatcher started");

        loop {
            if shutdown.is_shutting_down() {
                break;
            }

            let pulled = tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown_rx) => break,
                pulled = self.subscription.pull(self.ctx.poll_interval) => pulled,
            };

            match pulled {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                }
                Ok(None) => {}
                Err(BrokerError::Closed) => {
                    warn!(kind = T::KIND, worker = self.worker, "subscription closed");
                    break;
                }
                Err(err) => {
                    warn!(kind = T::KIND, worker = self.worker, error = %err, "pull failed");
                    tokio::select! {
                        () = wait_for_shutdown(&mut shutdown_rx) => break,
                        () = tokio::time::sleep(PULL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        if let Err(err) = self.subscription.unsubscribe().await {
            warn!(kind = T::KIND, worker = self.worker, error = %err, "unsubscribe failed");
        }
        info!(kind = T::KIND, worker = self.worker, "dispatcher stopped");
    }

    /// Pulls and processes at most one delivery.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the pull itself failed.
    pub async fn process_next(&self, max_wait: Duration) -> Result<Option<TaskOutcome>, BrokerError> {
        match self.subscription.pull(max_wait).await? {
            Some(delivery) => Ok(Some(self.process(delivery).await)),
            None => Ok(None),
        }
    }

    /// Processes one delivery through to settlement.
    pub async fn process(&self, delivery: Delivery) -> TaskOutcome {
        let span = info_span!(
            "reconcile",
            kind = T::KIND,
            worker = self.worker,
            delivery = delivery.id,
            object_id = tracing::field::Empty,
            operation = tracing::field::Empty,
        );

        async move {
            let _in_flight = self.ctx.shutdown.in_flight_guard();
            let start = Instant::now();
            let outcome = self.reconcile(delivery).await;

            metrics::counter!("reconcile_tasks_total", "kind" => T::KIND, "outcome" => outcome.label())
                .increment(1);
            metrics::histogram!("reconcile_task_duration_seconds", "kind" => T::KIND)
                .record(start.elapsed().as_secs_f64());

            match outcome {
                TaskOutcome::Requeued { reason, delay } => {
                    info!(outcome = outcome.label(), reason, delay_secs = delay.as_secs(), "task settled");
                }
                _ => info!(outcome = outcome.label(), "task settled"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn reconcile(&self, delivery: Delivery) -> TaskOutcome {
        let notification = match self.ctx.codec.decode::<T>(&delivery.payload) {
            Ok(notification) => notification,
            Err(err) => return self.redeliver_poison(&delivery, ReconcileError::from(err)).await,
        };

        let object_id = notification.object_id();
        let span = tracing::Span::current();
        span.record("object_id", object_id.as_str());
        span.record("operation", notification.operation.as_str());

        let (delay, requeue_payload) = self.ctx.requeue_plan(&notification, &delivery.payload);
        let task = Arc::new(ReconcileTask {
            subscription: Arc::clone(&self.subscription),
            locks: self.ctx.locks.clone(),
            delivery,
            object_id,
            requeue_payload,
            delay,
            settlement: Settlement::new(),
            lock_held: AtomicBool::new(false),
        });

        match self.ctx.locks.is_locked(&task.object_id).await {
            Ok(false) => {}
            Ok(true) => {
                let err = ReconcileError::LockContention {
                    key: self.ctx.locks.key(&task.object_id),
                };
                debug!(reason = err.label(), "object is locked, deferring");
                return Self::requeue(&task, &err).await;
            }
            Err(err) => {
                let err = ReconcileError::from(err);
                warn!(error = %err, "lock check failed, deferring");
                return Self::requeue(&task, &err).await;
            }
        }

        let watch = {
            let task = Arc::clone(&task);
            TaskWatch::spawn(self.ctx.shutdown.shutdown_receiver(), move || async move {
                if task.unlock_and_requeue().await {
                    info!(object_id = %task.object_id, "shutdown: unlocked and requeued in-flight task");
                }
            })
        };

        let outcome = self.reconcile_locked(&task, notification).await;
        watch.finish().await;
        outcome
    }

    async fn reconcile_locked(&self, task: &ReconcileTask, notification: Notification<T>) -> TaskOutcome {
        match self.ctx.locks.try_acquire(&task.object_id).await {
            Ok(true) => {
                task.mark_locked();
                if task.settlement.is_settled() {
                    task.release_lock().await;
                    return TaskOutcome::Interrupted;
                }
            }
            Ok(false) => {
                let err = ReconcileError::LockContention {
                    key: self.ctx.locks.key(&task.object_id),
                };
                debug!(reason = err.label(), "lost lock race, deferring");
                return Self::requeue(task, &err).await;
            }
            Err(err) => {
                let err = ReconcileError::from(err);
                warn!(error = %err, "lock acquire failed, deferring");
                return Self::requeue(task, &err).await;
            }
        }

        match self.dispatch(task, notification).await {
            Ok(()) => {
                if task.release_and_ack().await {
                    TaskOutcome::Completed
                } else {
                    TaskOutcome::Interrupted
                }
            }
            Err(ReconcileError::ObjectNotFound { id }) => {
                info!(object_id = %id, "object no longer exists, dropping");
                if task.release_and_ack().await {
                    TaskOutcome::Dropped
                } else {
                    TaskOutcome::Interrupted
                }
            }
            Err(err) => {
                match &err {
                    ReconcileError::UnrecognizedOperation { .. } => {
                        error!(error = %err, "unrecognized operation");
                    }
                    _ => warn!(reason = err.label(), error = %err, "reconcile failed"),
                }
                Self::requeue(task, &err).await
            }
        }
    }

    /// Steps 7 to 9: fetch, handle, mark reconciled.
    async fn dispatch(&self, task: &ReconcileTask, notification: Notification<T>) -> Result<(), ReconcileError> {
        let operation = notification.operation;
        if let Operation::Unrecognized(other) = &operation {
            return Err(ReconcileError::UnrecognizedOperation {
                operation: other.clone(),
            });
        }

        let object = if operation == Operation::Deleted {
            notification.object
        } else {
            self.ctx.api.get_by_id(&task.object_id).await.map_err(|err| {
                if err.is_not_found() {
                    ReconcileError::ObjectNotFound {
                        id: task.object_id.clone(),
                    }
                } else {
                    ReconcileError::UpstreamApi(err)
                }
            })?
        };

        let reconciler = &self.ctx.reconciler;
        let handled = match &operation {
            Operation::Created => reconciler.created(&object).await,
            Operation::Updated => reconciler.updated(&object).await,
            Operation::Deleted => reconciler.deleted(&object).await,
            Operation::Unrecognized(other) => {
                return Err(ReconcileError::UnrecognizedOperation {
                    operation: other.clone(),
                })
            }
        };
        handled.map_err(|source| ReconcileError::Handler {
            operation: operation.clone(),
            source,
        })?;

        // Deleted objects have no flag to set; a watcher-settled task must not
        // advance state after its delivery was requeued.
        if operation == Operation::Deleted || task.settlement.is_settled() {
            return Ok(());
        }

        self.ctx
            .api
            .update(&task.object_id, &ObjectPatch::reconciled())
            .await
            .map_err(ReconcileError::UpstreamApi)?;
        debug!("marked reconciled");
        Ok(())
    }

    async fn requeue(task: &ReconcileTask, err: &ReconcileError) -> TaskOutcome {
        if task.unlock_and_requeue().await {
            TaskOutcome::Requeued {
                reason: err.label(),
                delay: task.delay,
            }
        } else {
            TaskOutcome::Interrupted
        }
    }

    async fn redeliver_poison(&self, delivery: &Delivery, err: ReconcileError) -> TaskOutcome {
        let delay = self.ctx.poison_redelivery_delay;
        warn!(
            error = %err,
            delivery_count = delivery.delivery_count,
            "undecodable payload, redelivering unchanged"
        );
        if let Err(broker_err) = self
            .subscription
            .requeue(delivery, delivery.payload.clone(), delay)
            .await
        {
            let broker_err = ReconcileError::from(broker_err);
            error!(
                reason = broker_err.label(),
                error = %broker_err,
                "poison redelivery failed, relying on broker redelivery"
            );
        }
        TaskOutcome::Requeued {
            reason: err.label(),
            delay,
        }
    }
}

impl<T: Resource> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kind", &T::KIND)
            .field("worker", &self.worker)
            .field("locks", &self.ctx.locks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use reconcile_core::{ManualClock, WireFormat};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::lock::MemoryLockStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Volume {
        id: u64,
    }

    impl Resource for Volume {
        const KIND: &'static str = "Volume";

        fn id(&self) -> String {
            self.id.to_string()
        }
    }

    struct NoApi;

    #[async_trait::async_trait]
    impl ApiClient<Volume> for NoApi {
        async fn get_by_id(&self, id: &str) -> Result<Volume, crate::error::ApiError> {
            Err(crate::error::ApiError::NotFound { id: id.to_string() })
        }

        async fn update(&self, id: &str, _patch: &ObjectPatch) -> Result<Volume, crate::error::ApiError> {
            Err(crate::error::ApiError::NotFound { id: id.to_string() })
        }
    }

    struct NoopReconciler;

    #[async_trait::async_trait]
    impl Reconciler<Volume> for NoopReconciler {
        async fn created(&self, _object: &Volume) -> anyhow::Result<()> {
            Ok(())
        }

        async fn updated(&self, _object: &Volume) -> anyhow::Result<()> {
            Ok(())
        }

        async fn deleted(&self, _object: &Volume) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn context(clock: Arc<ManualClock>) -> DispatcherContext<Volume> {
        let store = Arc::new(MemoryLockStore::new("test", Duration::from_secs(60)));
        DispatcherContext {
            codec: NotificationCodec::new(WireFormat::Json),
            requeue: RequeuePolicy::default(),
            poll_interval: Duration::from_millis(10),
            poison_redelivery_delay: Duration::from_secs(1),
            locks: LockBucket::new(store, Volume::KIND, "ctrl-a"),
            api: Arc::new(NoApi),
            reconciler: Arc::new(NoopReconciler),
            clock,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(TaskOutcome::Completed.label(), "completed");
        assert_eq!(TaskOutcome::Dropped.label(), "dropped");
        assert_eq!(TaskOutcome::Interrupted.label(), "interrupted");
        let requeued = TaskOutcome::Requeued {
            reason: "handler",
            delay: Duration::from_secs(5),
        };
        assert_eq!(requeued.label(), "requeued");
    }

    #[test]
    fn first_requeue_uses_initial_delay() {
        let ctx = context(Arc::new(ManualClock::new(1_000_000)));
        let notification = Notification::new(Operation::Deleted, Volume { id: 12 });

        let (delay, payload) = ctx.requeue_plan(&notification, &Bytes::new());
        assert_eq!(delay, Duration::from_secs(5));

        let redelivered: Notification<Volume> = ctx.codec.decode(&payload).unwrap();
        assert_eq!(redelivered.requeue, Some(true));
        assert_eq!(redelivered.last_requeue_delay, 5);
        assert_eq!(redelivered.operation, Operation::Deleted);
        assert_eq!(redelivered.object, Volume { id: 12 });
    }

    #[test]
    fn accumulated_backoff_grows_the_delay() {
        let ctx = context(Arc::new(ManualClock::new(1_000_000)));
        let mut notification = Notification::new(Operation::Updated, Volume { id: 3 });
        notification.requeue = Some(true);
        notification.last_requeue_delay = 65;

        let (delay, payload) = ctx.requeue_plan(&notification, &Bytes::new());
        // 65s elapsed spans two 30s windows: 5s doubled twice.
        assert_eq!(delay, Duration::from_secs(20));
        let redelivered: Notification<Volume> = ctx.codec.decode(&payload).unwrap();
        assert_eq!(redelivered.last_requeue_delay, 85);
    }

    #[test]
    fn negative_backoff_counts_as_none() {
        let ctx = context(Arc::new(ManualClock::new(1_000_000)));
        let mut notification = Notification::new(Operation::Created, Volume { id: 4 });
        notification.last_requeue_delay = -30;

        let (delay, _) = ctx.requeue_plan(&notification, &Bytes::new());
        assert_eq!(delay, Duration::from_secs(5));
    }

    proptest::proptest! {
        #[test]
        fn repeated_requeues_accumulate_bounded_delays(start in 0i64..100_000, rounds in 1usize..40) {
            let ctx = context(Arc::new(ManualClock::new(1_000_000)));
            let mut notification = Notification::new(Operation::Updated, Volume { id: 1 });
            notification.last_requeue_delay = start;

            let mut previous = Duration::ZERO;
            for _ in 0..rounds {
                let before = notification.last_requeue_delay;
                let (delay, payload) = ctx.requeue_plan(&notification, &Bytes::new());
                proptest::prop_assert!(delay >= previous);
                proptest::prop_assert!(delay <= Duration::from_secs(600));
                notification = ctx.codec.decode(&payload).unwrap();
                proptest::prop_assert_eq!(notification.requeue, Some(true));
                proptest::prop_assert!(notification.last_requeue_delay > before);
                previous = delay;
            }
        }
    }
}
