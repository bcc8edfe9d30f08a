//! Reconcile Core: notification codec, requeue policy, and the resource model
//! shared by controllers and the services that publish to them.

pub mod clock;
pub mod notification;
pub mod requeue;
pub mod resource;
pub mod subject;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use notification::{CodecError, Notification, NotificationCodec, Operation, WireFormat};
pub use requeue::RequeuePolicy;
pub use resource::{lock_key, Resource};
pub use subject::{subject_for_kind, subject_matches};
