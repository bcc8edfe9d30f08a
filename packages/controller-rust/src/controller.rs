//! Per-object-type controller setup.
//!
//! A [`Controller`] binds one [`Resource`] kind to its collaborators and,
//! at startup, verifies the lock bucket and binds one subscription handle
//! per worker. Setup failures are fatal: they are returned before any
//! dispatcher starts.

use std::sync::Arc;

use reconcile_core::{ClockSource, NotificationCodec, Resource, SystemClock};

use crate::broker::{Broker, ConsumerSpec};
use crate::config::ControllerConfig;
use crate::dispatcher::{Dispatcher, DispatcherContext};
use crate::error::SetupError;
use crate::lock::{LockBucket, LockStore, MemoryLockStore};
use crate::pool::WorkerPool;
use crate::shutdown::ShutdownController;
use crate::traits::{ApiClient, Reconciler};

/// Reconcile controller for objects of kind `T`.
pub struct Controller<T: Resource> {
    config: ControllerConfig,
    lock_store: Arc<dyn LockStore>,
    api: Arc<dyn ApiClient<T>>,
    reconciler: Arc<dyn Reconciler<T>>,
    clock: Arc<dyn ClockSource>,
    holder: String,
}

impl<T: Resource> Controller<T> {
    /// Creates a controller. The lock holder identity defaults to a random
    /// UUID; the runtime replaces it with its instance id.
    #[must_use]
    pub fn new(
        config: ControllerConfig,
        lock_store: Arc<dyn LockStore>,
        api: Arc<dyn ApiClient<T>>,
        reconciler: Arc<dyn Reconciler<T>>,
    ) -> Self {
        Self {
            config,
            lock_store,
            api,
            reconciler,
            clock: Arc::new(SystemClock),
            holder: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Creates a controller whose locks live in this process only.
    #[must_use]
    pub fn with_memory_locks(
        config: ControllerConfig,
        api: Arc<dyn ApiClient<T>>,
        reconciler: Arc<dyn Reconciler<T>>,
    ) -> Self {
        let store = Arc::new(MemoryLockStore::new(
            config.lock.bucket.clone(),
            config.lock.ttl,
        ));
        Self::new(config, store, api, reconciler)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    #[must_use]
    pub fn lock_store(&self) -> &Arc<dyn LockStore> {
        &self.lock_store
    }

    /// The durable consumer this controller binds to.
    #[must_use]
    pub fn consumer_spec(&self) -> ConsumerSpec {
        ConsumerSpec {
            stream: self.config.stream.clone(),
            consumer: self.config.consumer_name(T::KIND),
            filter_subject: self.config.filter_subject(T::KIND),
        }
    }

    /// Verifies the lock bucket and binds one subscription per worker.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if the configuration is invalid, the lock
    /// bucket is unavailable, or the durable consumer cannot be bound or
    /// would redeliver a message before its lock expires.
    pub async fn dispatchers(
        &self,
        broker: &dyn Broker,
        shutdown: Arc<ShutdownController>,
    ) -> Result<Vec<Dispatcher<T>>, SetupError> {
        if self.config.workers == 0 {
            return Err(SetupError::Config(format!(
                "{} controller needs at least one worker",
                T::KIND
            )));
        }
        if self.config.poll_interval.is_zero() {
            return Err(SetupError::Config("poll interval must be positive".to_string()));
        }
        let ttl = self.lock_store.ttl();
        if self.config.ack_wait < ttl {
            return Err(SetupError::Config(format!(
                "ack wait {:?} is shorter than the lock TTL {ttl:?}",
                self.config.ack_wait
            )));
        }

        self.lock_store
            .verify()
            .await
            .map_err(|source| SetupError::LockBucket {
                bucket: self.lock_store.bucket().to_string(),
                source,
            })?;

        let spec = self.consumer_spec();
        let ctx = Arc::new(DispatcherContext {
            codec: NotificationCodec::new(self.config.wire_format),
            requeue: self.config.requeue,
            poll_interval: self.config.poll_interval,
            poison_redelivery_delay: self.config.poison_redelivery_delay,
            locks: LockBucket::new(Arc::clone(&self.lock_store), T::KIND, self.holder.clone()),
            api: Arc::clone(&self.api),
            reconciler: Arc::clone(&self.reconciler),
            clock: Arc::clone(&self.clock),
            shutdown,
        });

        let mut dispatchers = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers {
            let subscription = broker
                .subscribe(&spec)
                .await
                .map_err(|source| SetupError::Subscribe {
                    stream: spec.stream.clone(),
                    consumer: spec.consumer.clone(),
                    source,
                })?;
            if subscription.ack_wait() < self.config.ack_wait {
                if let Err(err) = subscription.unsubscribe().await {
                    tracing::warn!(consumer = %spec.consumer, error = %err, "unsubscribe failed");
                }
                return Err(SetupError::Config(format!(
                    "consumer {} acks within {:?}, {} controller needs at least {:?}",
                    spec.consumer,
                    subscription.ack_wait(),
                    T::KIND,
                    self.config.ack_wait
                )));
            }
            dispatchers.push(Dispatcher::new(worker, Arc::clone(&ctx), subscription));
        }

        tracing::info!(
            kind = T::KIND,
            stream = %spec.stream,
            consumer = %spec.consumer,
            filter = %spec.filter_subject,
            workers = dispatchers.len(),
            "controller ready"
        );
        Ok(dispatchers)
    }

    /// Sets up and spawns the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] as [`Controller::dispatchers`] does.
    pub async fn start(
        &self,
        broker: &dyn Broker,
        shutdown: Arc<ShutdownController>,
    ) -> Result<WorkerPool, SetupError> {
        Ok(WorkerPool::start(self.dispatchers(broker, shutdown).await?))
    }
}

impl<T: Resource> std::fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("kind", &T::KIND)
            .field("config", &self.config)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}
