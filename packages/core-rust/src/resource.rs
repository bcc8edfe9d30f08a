use serde::de::DeserializeOwned;
use serde::Serialize;

/// A domain object type managed by a controller.
///
/// The engine never looks inside an object beyond its identity: the
/// snapshot travels opaquely through notifications and is handed to the
/// business handlers as-is.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Type name of the object, e.g. `"Network"`. Drives the subject filter,
    /// the lock-key namespace, and the default API collection path.
    const KIND: &'static str;

    /// Unique identifier of this object within its kind.
    fn id(&self) -> String;

    /// API collection segment for this kind. Defaults to the lower-cased
    /// kind with an `s` suffix.
    #[must_use]
    fn collection() -> String {
        format!("{}s", Self::KIND.to_ascii_lowercase())
    }
}

/// Lock key for an object: the object ID qualified by its kind, so several
/// controllers can share one bucket without colliding.
#[must_use]
pub fn lock_key(kind: &str, id: &str) -> String {
    format!("{}.{id}", kind.to_ascii_lowercase())
}
