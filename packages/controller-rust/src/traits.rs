use async_trait::async_trait;
use reconcile_core::Resource;
use serde::Serialize;

use crate::error::ApiError;

/// Partial update sent to the API service. Only fields that are `Some` are
/// serialized, so the service patches them and leaves the rest untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<bool>,
}

impl ObjectPatch {
    /// Patch that sets the object's reconciled flag.
    #[must_use]
    pub fn reconciled() -> Self {
        Self {
            reconciled: Some(true),
        }
    }
}

/// Client for the API service that owns objects of kind `T`.
#[async_trait]
pub trait ApiClient<T: Resource>: Send + Sync {
    /// Fetch the current state of an object.
    ///
    /// Returns [`ApiError::NotFound`] when the object no longer exists.
    async fn get_by_id(&self, id: &str) -> Result<T, ApiError>;

    /// Apply a partial update and return the updated object.
    async fn update(&self, id: &str, patch: &ObjectPatch) -> Result<T, ApiError>;
}

/// Business handlers for one object kind.
///
/// Handlers must be idempotent: a notification can be delivered more than
/// once, and a handler can run again after it succeeded if the follow-up
/// reconciled-flag update failed.
#[async_trait]
pub trait Reconciler<T: Resource>: Send + Sync {
    async fn created(&self, object: &T) -> anyhow::Result<()>;

    async fn updated(&self, object: &T) -> anyhow::Result<()>;

    /// Called with the snapshot carried by the notification, since the
    /// object can no longer be fetched.
    async fn deleted(&self, object: &T) -> anyhow::Result<()>;
}
