//! Reconcile Controller: durable pull dispatch, TTL locks, and graceful
//! shutdown for per-object-type reconciliation controllers.

pub mod api;
pub mod broker;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod network;
pub mod pool;
pub mod runtime;
pub mod shutdown;
pub mod telemetry;
pub mod traits;

pub use api::HttpApiClient;
pub use broker::{Broker, ConsumerSpec, Delivery, MemoryBroker, Subscription};
pub use config::{ApiConfig, ControllerConfig, LockConfig, LogConfig, RuntimeArgs, RuntimeConfig};
pub use controller::Controller;
pub use dispatcher::{Dispatcher, DispatcherContext, TaskOutcome};
pub use error::{ApiError, ReconcileError, SetupError};
pub use lock::{LockBucket, LockStore, MemoryLockStore};
pub use pool::WorkerPool;
pub use runtime::ControllerRuntime;
pub use shutdown::{HealthState, ShutdownController};
pub use traits::{ApiClient, ObjectPatch, Reconciler};
