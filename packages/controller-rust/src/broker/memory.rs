//! In-process broker with durable, explicitly acknowledged pull consumers.
//!
//! Streams capture subjects by filter; each consumer on a stream gets its own
//! copy of every captured message that matches the consumer's filter. A
//! pulled message stays in flight until it is acked, requeued, or its ack
//! deadline passes, after which it becomes available again.
//!
//! Timing uses `tokio::time`, so tests running with a paused clock see
//! requeue delays and ack deadlines elapse without real waiting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reconcile_core::subject_matches;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Broker, BrokerError, ConsumerSpec, Delivery, Subscription, DEFAULT_ACK_WAIT};

struct Pending {
    id: u64,
    subject: String,
    payload: Bytes,
    available_at: Instant,
    delivery_count: u32,
}

struct InFlight {
    message: Pending,
    handle: u64,
    ack_deadline: Instant,
}

struct ConsumerState {
    filter: String,
    pending: VecDeque<Pending>,
    in_flight: HashMap<u64, InFlight>,
    handles: HashSet<u64>,
}

enum PullPoll {
    Ready(Delivery),
    Wait(Option<Instant>),
}

impl ConsumerState {
    fn new(filter: String) -> Self {
        Self {
            filter,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            handles: HashSet::new(),
        }
    }

    /// Returns messages whose ack deadline passed to the front of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.ack_deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.in_flight.remove(&id) {
                let mut message = entry.message;
                message.available_at = now;
                self.pending.push_front(message);
            }
        }
    }

    fn poll(&mut self, handle: u64, now: Instant, ack_wait: Duration) -> PullPoll {
        self.reclaim_expired(now);

        let ready = self
            .pending
            .iter()
            .position(|message| message.available_at <= now);
        if let Some(index) = ready {
            if let Some(mut message) = self.pending.remove(index) {
                message.delivery_count = message.delivery_count.saturating_add(1);
                let delivery = Delivery {
                    id: message.id,
                    subject: message.subject.clone(),
                    payload: message.payload.clone(),
                    delivery_count: message.delivery_count,
                };
                self.in_flight.insert(
                    message.id,
                    InFlight {
                        message,
                        handle,
                        ack_deadline: now + ack_wait,
                    },
                );
                return PullPoll::Ready(delivery);
            }
        }

        let next_pending = self.pending.iter().map(|m| m.available_at).min();
        let next_deadline = self.in_flight.values().map(|e| e.ack_deadline).min();
        PullPoll::Wait(match (next_pending, next_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    fn take_in_flight(&mut self, handle: u64, id: u64) -> Result<InFlight, BrokerError> {
        match self.in_flight.get(&id) {
            Some(entry) if entry.handle == handle => {
                self.in_flight.remove(&id).ok_or(BrokerError::NotInFlight(id))
            }
            _ => Err(BrokerError::NotInFlight(id)),
        }
    }

    fn detach(&mut self, handle: u64) {
        self.handles.remove(&handle);
        let held: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.handle == handle)
            .map(|(id, _)| *id)
            .collect();
        for id in held {
            if let Some(entry) = self.in_flight.remove(&id) {
                self.pending.push_front(entry.message);
            }
        }
    }
}

struct StreamState {
    subjects: Vec<String>,
    consumers: HashMap<String, ConsumerState>,
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
    next_seq: u64,
    next_handle: u64,
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    ack_wait: Duration,
}

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new(ack_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                ack_wait,
            }),
        }
    }

    /// Creates a stream capturing `subjects`, or replaces its subject list.
    pub fn add_stream(&self, name: &str, subjects: &[&str]) {
        let mut state = self.shared.state.lock();
        let subjects: Vec<String> = subjects.iter().map(|s| (*s).to_string()).collect();
        state
            .streams
            .entry(name.to_string())
            .and_modify(|stream| stream.subjects.clone_from(&subjects))
            .or_insert_with(|| StreamState {
                subjects,
                consumers: HashMap::new(),
            });
    }

    /// Provisions a durable consumer on an existing stream.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::MissingStream`] if the stream does not exist.
    pub fn add_consumer(&self, spec: &ConsumerSpec) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        let stream = state
            .streams
            .get_mut(&spec.stream)
            .ok_or_else(|| BrokerError::MissingStream(spec.stream.clone()))?;
        stream
            .consumers
            .entry(spec.consumer.clone())
            .or_insert_with(|| ConsumerState::new(spec.filter_subject.clone()));
        Ok(())
    }

    /// Messages waiting (including delayed ones) on a consumer.
    #[must_use]
    pub fn pending_count(&self, stream: &str, consumer: &str) -> usize {
        self.inspect(stream, consumer, |c| c.pending.len())
    }

    /// Messages pulled but not yet settled on a consumer.
    #[must_use]
    pub fn in_flight_count(&self, stream: &str, consumer: &str) -> usize {
        self.inspect(stream, consumer, |c| c.in_flight.len())
    }

    /// Payloads waiting on a consumer, in queue order.
    #[must_use]
    pub fn pending_payloads(&self, stream: &str, consumer: &str) -> Vec<Bytes> {
        self.inspect(stream, consumer, |c| {
            c.pending.iter().map(|m| m.payload.clone()).collect()
        })
    }

    fn inspect<R: Default>(&self, stream: &str, consumer: &str, f: impl FnOnce(&ConsumerState) -> R) -> R {
        let state = self.shared.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map(f)
            .unwrap_or_default()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_WAIT)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<Arc<dyn Subscription>, BrokerError> {
        let mut state = self.shared.state.lock();
        state.next_handle += 1;
        let handle = state.next_handle;

        let stream = state
            .streams
            .get_mut(&spec.stream)
            .ok_or_else(|| BrokerError::MissingStream(spec.stream.clone()))?;
        let consumer = stream
            .consumers
            .get_mut(&spec.consumer)
            .ok_or_else(|| BrokerError::MissingConsumer {
                stream: spec.stream.clone(),
                consumer: spec.consumer.clone(),
            })?;
        consumer.handles.insert(handle);

        Ok(Arc::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            stream: spec.stream.clone(),
            consumer: spec.consumer.clone(),
            handle,
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let now = Instant::now();
            let mut captured = false;

            for stream in state.streams.values_mut() {
                if !stream.subjects.iter().any(|f| subject_matches(f, subject)) {
                    continue;
                }
                captured = true;
                for consumer in stream.consumers.values_mut() {
                    if subject_matches(&consumer.filter, subject) {
                        state.next_seq += 1;
                        consumer.pending.push_back(Pending {
                            id: state.next_seq,
                            subject: subject.to_string(),
                            payload: payload.clone(),
                            available_at: now,
                            delivery_count: 0,
                        });
                    }
                }
            }

            if !captured {
                return Err(BrokerError::NoStreamForSubject(subject.to_string()));
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Pull handle bound to one consumer of a [`MemoryBroker`].
struct MemorySubscription {
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
    handle: u64,
}

impl MemorySubscription {
    fn with_consumer<R>(
        &self,
        f: impl FnOnce(&mut ConsumerState) -> Result<R, BrokerError>,
    ) -> Result<R, BrokerError> {
        let mut state = self.shared.state.lock();
        let consumer = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.consumer))
            .filter(|c| c.handles.contains(&self.handle))
            .ok_or(BrokerError::Closed)?;
        f(consumer)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn ack_wait(&self) -> Duration {
        self.shared.ack_wait
    }

    async fn pull(&self, max_wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + max_wait;
        loop {
            // Registered before inspecting state so a publish between the
            // check and the wait still wakes this puller.
            let notified = self.shared.notify.notified();
            let now = Instant::now();
            let ack_wait = self.shared.ack_wait;

            match self.with_consumer(|c| Ok(c.poll(self.handle, now, ack_wait)))? {
                PullPoll::Ready(delivery) => return Ok(Some(delivery)),
                PullPoll::Wait(next) => {
                    if now >= deadline {
                        return Ok(None);
                    }
                    let wake_at = next.map_or(deadline, |t| t.min(deadline));
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep_until(wake_at) => {}
                    }
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.with_consumer(|c| c.take_in_flight(self.handle, delivery.id).map(|_| ()))
    }

    async fn requeue(
        &self,
        delivery: &Delivery,
        payload: Bytes,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.with_consumer(|c| {
            let entry = c.take_in_flight(self.handle, delivery.id)?;
            c.pending.push_back(Pending {
                payload,
                available_at: Instant::now() + delay,
                ..entry.message
            });
            Ok(())
        })?;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.state.lock();
            if let Some(consumer) = state
                .streams
                .get_mut(&self.stream)
                .and_then(|s| s.consumers.get_mut(&self.consumer))
            {
                consumer.detach(self.handle);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
