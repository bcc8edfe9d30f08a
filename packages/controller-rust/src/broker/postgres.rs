//! Postgres-backed [`Broker`] for controllers spread across processes.
//!
//! Three tables share a name prefix (default `reconcile`) and are
//! provisioned outside the controller:
//!
//! ```sql
//! CREATE TABLE reconcile_streams (
//!     name     TEXT   PRIMARY KEY,
//!     subjects TEXT[] NOT NULL
//! );
//! CREATE TABLE reconcile_consumers (
//!     stream         TEXT NOT NULL REFERENCES reconcile_streams (name),
//!     consumer       TEXT NOT NULL,
//!     filter_subject TEXT NOT NULL,
//!     PRIMARY KEY (stream, consumer)
//! );
//! CREATE TABLE reconcile_messages (
//!     id               BIGSERIAL   PRIMARY KEY,
//!     stream           TEXT        NOT NULL,
//!     consumer         TEXT        NOT NULL,
//!     subject          TEXT        NOT NULL,
//!     payload          BYTEA       NOT NULL,
//!     available_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     delivery_count   INTEGER     NOT NULL DEFAULT 0,
//!     claimed_by       TEXT,
//!     claim_expires_at TIMESTAMPTZ
//! );
//! CREATE INDEX ON reconcile_messages (stream, consumer, available_at, id);
//! ```
//!
//! Publishing fans a message out into one row per matching consumer.
//! Pulling claims the oldest available row with `FOR UPDATE SKIP LOCKED`,
//! so competing handles never receive the same row. A claim lapses after
//! the ack wait and the row becomes claimable again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reconcile_core::subject_matches;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Broker, BrokerError, ConsumerSpec, Delivery, Subscription, DEFAULT_ACK_WAIT};
use crate::lock::postgres::is_identifier;

/// Default prefix for the broker's tables.
pub const DEFAULT_TABLE_PREFIX: &str = "reconcile";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Tables {
    streams: String,
    consumers: String,
    messages: String,
}

/// Broker whose streams live in Postgres tables.
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    tables: Arc<Tables>,
    ack_wait: Duration,
    poll_interval: Duration,
}

impl PgBroker {
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] if `table_prefix` is not a plain
    /// SQL identifier.
    pub fn new(pool: PgPool, table_prefix: &str) -> Result<Self, BrokerError> {
        if !is_identifier(table_prefix) {
            return Err(BrokerError::Unavailable(format!(
                "invalid broker table prefix {table_prefix:?}"
            )));
        }
        Ok(Self {
            pool,
            tables: Arc::new(Tables {
                streams: format!("{table_prefix}_streams"),
                consumers: format!("{table_prefix}_consumers"),
                messages: format!("{table_prefix}_messages"),
            }),
            ack_wait: DEFAULT_ACK_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    #[must_use]
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// How often an idle `pull` re-checks the table.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Creates a stream, or replaces its subject list.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Database`] on query failure.
    pub async fn add_stream(&self, name: &str, subjects: &[&str]) -> Result<(), BrokerError> {
        let sql = format!(
            "INSERT INTO {} (name, subjects) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET subjects = EXCLUDED.subjects",
            self.tables.streams
        );
        sqlx::query(&sql)
            .bind(name)
            .bind(subjects)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Provisions a durable consumer on an existing stream.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::MissingStream`] if the stream does not exist.
    pub async fn add_consumer(&self, spec: &ConsumerSpec) -> Result<(), BrokerError> {
        if !self.stream_exists(&spec.stream).await? {
            return Err(BrokerError::MissingStream(spec.stream.clone()));
        }
        let sql = format!(
            "INSERT INTO {} (stream, consumer, filter_subject) VALUES ($1, $2, $3) \
             ON CONFLICT (stream, consumer) DO NOTHING",
            self.tables.consumers
        );
        sqlx::query(&sql)
            .bind(&spec.stream)
            .bind(&spec.consumer)
            .bind(&spec.filter_subject)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stream_exists(&self, name: &str) -> Result<bool, BrokerError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE name = $1)",
            self.tables.streams
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<Arc<dyn Subscription>, BrokerError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE stream = $1 AND consumer = $2)",
            self.tables.consumers
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(&spec.stream)
            .bind(&spec.consumer)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            if !self.stream_exists(&spec.stream).await? {
                return Err(BrokerError::MissingStream(spec.stream.clone()));
            }
            return Err(BrokerError::MissingConsumer {
                stream: spec.stream.clone(),
                consumer: spec.consumer.clone(),
            });
        }

        Ok(Arc::new(PgSubscription {
            broker: self.clone(),
            stream: spec.stream.clone(),
            consumer: spec.consumer.clone(),
            handle: Uuid::new_v4().to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        let sql = format!(
            "SELECT s.name, s.subjects, c.consumer, c.filter_subject \
             FROM {} s LEFT JOIN {} c ON c.stream = s.name",
            self.tables.streams, self.tables.consumers
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut captured = false;
        let mut targets: Vec<(String, String)> = Vec::new();
        for row in &rows {
            let subjects: Vec<String> = row.try_get("subjects")?;
            if !subjects.iter().any(|f| subject_matches(f, subject)) {
                continue;
            }
            captured = true;
            let consumer: Option<String> = row.try_get("consumer")?;
            let filter: Option<String> = row.try_get("filter_subject")?;
            if let (Some(consumer), Some(filter)) = (consumer, filter) {
                if subject_matches(&filter, subject) {
                    targets.push((row.try_get("name")?, consumer));
                }
            }
        }
        if !captured {
            return Err(BrokerError::NoStreamForSubject(subject.to_string()));
        }

        let sql = format!(
            "INSERT INTO {} (stream, consumer, subject, payload) VALUES ($1, $2, $3, $4)",
            self.tables.messages
        );
        let mut tx = self.pool.begin().await?;
        for (stream, consumer) in &targets {
            sqlx::query(&sql)
                .bind(stream)
                .bind(consumer)
                .bind(subject)
                .bind(payload.as_ref())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Pull handle bound to one consumer of a [`PgBroker`].
struct PgSubscription {
    broker: PgBroker,
    stream: String,
    consumer: String,
    handle: String,
    closed: AtomicBool,
}

impl PgSubscription {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    async fn claim(&self) -> Result<Option<Delivery>, BrokerError> {
        let table = &self.broker.tables.messages;
        let sql = format!(
            "UPDATE {table} SET claimed_by = $3, \
                 claim_expires_at = now() + make_interval(secs => $4), \
                 delivery_count = delivery_count + 1 \
             WHERE id = ( \
                 SELECT id FROM {table} \
                 WHERE stream = $1 AND consumer = $2 AND available_at <= now() \
                   AND (claimed_by IS NULL OR claim_expires_at <= now()) \
                 ORDER BY available_at, id \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1) \
             RETURNING id, subject, payload, delivery_count"
        );
        let row = sqlx::query(&sql)
            .bind(&self.stream)
            .bind(&self.consumer)
            .bind(&self.handle)
            .bind(self.broker.ack_wait.as_secs_f64())
            .fetch_optional(&self.broker.pool)
            .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }
}

fn delivery_from_row(row: &PgRow) -> Result<Delivery, BrokerError> {
    let id: i64 = row.try_get("id")?;
    let delivery_count: i32 = row.try_get("delivery_count")?;
    let payload: Vec<u8> = row.try_get("payload")?;
    Ok(Delivery {
        id: u64::try_from(id).unwrap_or_default(),
        subject: row.try_get("subject")?,
        payload: Bytes::from(payload),
        delivery_count: u32::try_from(delivery_count).unwrap_or_default(),
    })
}

fn message_id(delivery: &Delivery) -> Result<i64, BrokerError> {
    i64::try_from(delivery.id).map_err(|_| BrokerError::NotInFlight(delivery.id))
}

#[async_trait]
impl Subscription for PgSubscription {
    fn ack_wait(&self) -> Duration {
        self.broker.ack_wait
    }

    async fn pull(&self, max_wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            self.ensure_open()?;
            if let Some(delivery) = self.claim().await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = (now + self.broker.poll_interval).min(deadline);
            tokio::time::sleep_until(wake_at).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND claimed_by = $2 RETURNING id",
            self.broker.tables.messages
        );
        let deleted: Option<i64> = sqlx::query_scalar(&sql)
            .bind(message_id(delivery)?)
            .bind(&self.handle)
            .fetch_optional(&self.broker.pool)
            .await?;
        deleted
            .map(|_| ())
            .ok_or(BrokerError::NotInFlight(delivery.id))
    }

    async fn requeue(
        &self,
        delivery: &Delivery,
        payload: Bytes,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let sql = format!(
            "UPDATE {} SET payload = $3, \
                 available_at = now() + make_interval(secs => $4), \
                 claimed_by = NULL, claim_expires_at = NULL \
             WHERE id = $1 AND claimed_by = $2 RETURNING id",
            self.broker.tables.messages
        );
        let updated: Option<i64> = sqlx::query_scalar(&sql)
            .bind(message_id(delivery)?)
            .bind(&self.handle)
            .bind(payload.as_ref())
            .bind(delay.as_secs_f64())
            .fetch_optional(&self.broker.pool)
            .await?;
        updated
            .map(|_| ())
            .ok_or(BrokerError::NotInFlight(delivery.id))
    }

    async fn unsubscribe(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET claimed_by = NULL, claim_expires_at = NULL WHERE claimed_by = $1",
            self.broker.tables.messages
        );
        sqlx::query(&sql)
            .bind(&self.handle)
            .execute(&self.broker.pool)
            .await?;
        Ok(())
    }
}
