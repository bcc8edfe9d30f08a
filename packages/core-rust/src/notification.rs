//! Change notifications and their wire codec.
//!
//! The API service publishes one [`Notification`] per object mutation. The
//! envelope is a named map with camelCase keys:
//!
//! ```text
//! { "operation": "created" | "updated" | "deleted",
//!   "requeue": bool,            // omitted on first delivery
//!   "lastRequeueDelay": i64,    // cumulative backoff seconds
//!   "object": <object snapshot> }
//! ```
//!
//! [`NotificationCodec`] encodes it as JSON (the default) or as named
//! `MsgPack` via `rmp_serde::to_vec_named()`. Both formats distinguish an
//! absent `requeue` flag from an explicit `false`.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::resource::Resource;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Kind of mutation a notification reports.
///
/// Serialized as a lower-case string. Values the engine does not know are
/// kept verbatim in [`Operation::Unrecognized`] instead of failing the decode,
/// so the dispatcher can report and requeue them rather than treat them as
/// poison payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Created,
    Updated,
    Deleted,
    Unrecognized(String),
}

impl Operation {
    /// Wire name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Unrecognized(other) => other,
        }
    }
}

impl From<String> for Operation {
    fn from(value: String) -> Self {
        match value.as_str() {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "deleted" => Self::Deleted,
            _ => Self::Unrecognized(value),
        }
    }
}

impl From<Operation> for String {
    fn from(value: Operation) -> Self {
        match value {
            Operation::Unrecognized(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Immutable change notification for one domain object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct Notification<T> {
    pub operation: Operation,
    /// `Some(true)` on redeliveries produced by a requeue. `None` when the
    /// publisher omitted the flag.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub requeue: Option<bool>,
    /// Seconds spent in backoff since the object was first notified.
    #[serde(default)]
    pub last_requeue_delay: i64,
    /// Snapshot of the object at notification time.
    pub object: T,
}

impl<T> Notification<T> {
    /// A first-delivery notification: no requeue flag, zero delay.
    #[must_use]
    pub fn new(operation: Operation, object: T) -> Self {
        Self {
            operation,
            requeue: None,
            last_requeue_delay: 0,
            object,
        }
    }

    /// Whether this notification is a redelivery.
    #[must_use]
    pub fn is_requeue(&self) -> bool {
        self.requeue.unwrap_or(false)
    }

    /// Backoff already accumulated, clamped to zero for negative values.
    #[must_use]
    pub fn elapsed_backoff_secs(&self) -> u64 {
        u64::try_from(self.last_requeue_delay).unwrap_or(0)
    }
}

impl<T: Resource> Notification<T> {
    /// ID of the object this notification refers to.
    #[must_use]
    pub fn object_id(&self) -> String {
        self.object.id()
    }
}

/// Borrowed view with the same wire shape as [`Notification`], so encoding
/// never has to clone the object snapshot.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a, T> {
    operation: &'a Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    requeue: Option<bool>,
    last_requeue_delay: i64,
    object: &'a T,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors produced by [`NotificationCodec`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode notification: {0}")]
    Encoding(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to decode notification: {0}")]
    Decoding(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Serialization format of the envelope on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    MsgPack,
}

/// Encodes and decodes notification envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationCodec {
    format: WireFormat,
}

impl NotificationCodec {
    #[must_use]
    pub const fn new(format: WireFormat) -> Self {
        Self { format }
    }

    #[must_use]
    pub const fn format(&self) -> WireFormat {
        self.format
    }

    /// Encodes an envelope from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encoding`] if the object cannot be serialized.
    pub fn encode<T: Serialize>(
        &self,
        operation: &Operation,
        requeue: Option<bool>,
        last_requeue_delay: i64,
        object: &T,
    ) -> Result<Vec<u8>, CodecError> {
        let envelope = EnvelopeRef {
            operation,
            requeue,
            last_requeue_delay,
            object,
        };
        match self.format {
            WireFormat::Json => {
                serde_json::to_vec(&envelope).map_err(|e| CodecError::Encoding(Box::new(e)))
            }
            WireFormat::MsgPack => rmp_serde::to_vec_named(&envelope)
                .map_err(|e| CodecError::Encoding(Box::new(e))),
        }
    }

    /// Encodes a complete notification.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encoding`] if the object cannot be serialized.
    pub fn encode_notification<T: Serialize>(
        &self,
        notification: &Notification<T>,
    ) -> Result<Vec<u8>, CodecError> {
        self.encode(
            &notification.operation,
            notification.requeue,
            notification.last_requeue_delay,
            &notification.object,
        )
    }

    /// Decodes an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decoding`] on malformed input or when the object
    /// snapshot does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Notification<T>, CodecError> {
        match self.format {
            WireFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Decoding(Box::new(e)))
            }
            WireFormat::MsgPack => {
                rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decoding(Box::new(e)))
            }
        }
    }
}
