//! Object store abstraction
//!
//! The reconciler talks to a cluster only through this trait so it can be
//! driven against a real API server ([`KubeObjectStore`](crate::KubeObjectStore))
//! or an in-memory store in tests.

use crate::error::StoreError;
use crate::kind::ManagedKind;

/// Read/create/replace access to objects in one cluster.
///
/// `namespace` is ignored for cluster-scoped kinds.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `Ok(None)` if it does not exist.
    async fn get<K: ManagedKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError>;

    /// Create an object. Fails with [`StoreError::AlreadyExists`] on a name clash.
    async fn create<K: ManagedKind>(&self, namespace: Option<&str>, object: &K) -> Result<K, StoreError>;

    /// Replace an object. The object's `resourceVersion` is the concurrency
    /// token; a stale one fails with [`StoreError::Conflict`].
    async fn replace<K: ManagedKind>(&self, namespace: Option<&str>, object: &K) -> Result<K, StoreError>;
}
