//! Error taxonomy for the reconcile engine.
//!
//! [`ReconcileError`] classifies every way a single reconcile task can fail.
//! None of these escape the dispatcher loop: each is logged and turned into
//! an unlock-and-requeue (or, for [`ReconcileError::ObjectNotFound`], a drop).
//! Only [`SetupError`] is fatal, and only at startup.

use reconcile_core::{CodecError, Operation};

use crate::broker::BrokerError;
use crate::lock::LockStoreError;

/// Errors returned by an [`ApiClient`](crate::traits::ApiClient).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("object {id} not found")]
    NotFound { id: String },
    #[error("API responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("API request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failure of one reconcile task.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Payload could not be decoded; redelivered unchanged.
    #[error(transparent)]
    Decode(#[from] CodecError),
    /// Another reconciliation holds the object's lock.
    #[error("lock {key} is held by another reconciliation")]
    LockContention { key: String },
    /// The lock store could not answer; treated like contention.
    #[error("lock store error: {0}")]
    LockStore(#[from] LockStoreError),
    /// The object is gone; the task is dropped.
    #[error("object {id} no longer exists")]
    ObjectNotFound { id: String },
    #[error("upstream API error: {0}")]
    UpstreamApi(#[source] ApiError),
    #[error("{operation} handler failed: {source}")]
    Handler {
        operation: Operation,
        #[source]
        source: anyhow::Error,
    },
    #[error("unrecognized operation {operation:?}")]
    UnrecognizedOperation { operation: String },
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl ReconcileError {
    /// Short, stable label used in logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::LockContention { .. } => "lock_contention",
            Self::LockStore(_) => "lock_store",
            Self::ObjectNotFound { .. } => "not_found",
            Self::UpstreamApi(_) => "upstream_api",
            Self::Handler { .. } => "handler",
            Self::UnrecognizedOperation { .. } => "unrecognized_operation",
            Self::Broker(_) => "broker",
        }
    }
}

/// Fatal errors while bringing a controller up.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("cannot bind consumer {consumer} on stream {stream}: {source}")]
    Subscribe {
        stream: String,
        consumer: String,
        #[source]
        source: BrokerError,
    },
    #[error("lock bucket {bucket} unavailable: {source}")]
    LockBucket {
        bucket: String,
        #[source]
        source: LockStoreError,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}
