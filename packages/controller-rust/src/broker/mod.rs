//! Durable, explicitly acknowledged pull subscriptions.
//!
//! A [`Broker`] binds [`Subscription`] handles to pre-provisioned durable
//! consumers. Several handles bound to the same consumer compete for its
//! messages; a pulled message is invisible to the other handles until it
//! is acknowledged, requeued, or its ack deadline passes.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::MemoryBroker;
#[cfg(feature = "postgres")]
pub use postgres::PgBroker;

/// Default time a pulled message may stay unacknowledged. Equal to the
/// default lock TTL, so a delivery is never handed out again while its
/// reconciliation can still hold the object's lock.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(20 * 60);

/// A durable consumer: which stream it reads and which subjects it selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub consumer: String,
    pub filter_subject: String,
}

/// A message handed to one puller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned sequence, unique within the stream.
    pub id: u64,
    pub subject: String,
    pub payload: Bytes,
    /// How many times this message (or the message it replaced on requeue)
    /// has been handed out, including this delivery.
    pub delivery_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("stream {0} does not exist")]
    MissingStream(String),
    #[error("consumer {consumer} does not exist on stream {stream}")]
    MissingConsumer { stream: String, consumer: String },
    #[error("no stream captures subject {0}")]
    NoStreamForSubject(String),
    #[error("message {0} is not in flight on this subscription")]
    NotInFlight(u64),
    #[error("subscription is closed")]
    Closed,
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[cfg(feature = "postgres")]
    #[error("broker database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Entry point for binding subscriptions and publishing.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Binds a new pull handle to an existing durable consumer.
    ///
    /// Fails when the stream or consumer has not been provisioned.
    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<Arc<dyn Subscription>, BrokerError>;

    /// Appends a message to every stream capturing `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;
}

/// One pull handle on a durable consumer.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// How long a pulled message stays in flight before it is handed out
    /// again.
    fn ack_wait(&self) -> Duration;

    /// Waits up to `max_wait` for the next available message.
    async fn pull(&self, max_wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledges a delivery; it will not be redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Replaces a delivery with `payload`, made available after `delay`.
    /// Passing the original payload redelivers it unchanged.
    async fn requeue(
        &self,
        delivery: &Delivery,
        payload: Bytes,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Detaches this handle. Messages it still holds become available to
    /// other handles.
    async fn unsubscribe(&self) -> Result<(), BrokerError>;
}
