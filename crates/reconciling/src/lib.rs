//! Declarative reconciliation of Kubernetes objects
//!
//! Idempotently drives any number of objects of different kinds toward a
//! caller-supplied desired state, with optimistic-concurrency conflict
//! handling and per-object failure isolation.
//!
//! # Example
//!
//! ```no_run
//! use reconciling::{KubeObjectStore, ManagedObject, NamedObject, ObjectReconciler, owner_labels};
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use std::collections::BTreeMap;
//!
//! # async fn example(client: kube::Client) -> Result<(), reconciling::ReconcileError> {
//! let reconciler = ObjectReconciler::new(KubeObjectStore::new(client));
//! let objects = vec![ManagedObject::ConfigMap(NamedObject::new("fleet-settings", |mut cm: ConfigMap| {
//!     cm.data = Some(BTreeMap::from([("region".to_string(), "eu".to_string())]));
//!     Ok(cm)
//! }))];
//! let labels = owner_labels(BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), "fleet".to_string())]));
//!
//! reconciler.reconcile_objects(Some("kube-system"), &objects, &[labels]).await.into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **test-util**: in-memory [`MockObjectStore`] for unit tests of callers

pub mod backoff;
pub mod engine;
pub mod error;
pub mod kind;
pub mod kube_store;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod objects;
pub mod store;

pub use backoff::FibonacciBackoff;
pub use engine::{DEFAULT_MAX_ATTEMPTS, ObjectReconciler};
pub use error::{ReconcileError, StoreError};
pub use kind::ManagedKind;
pub use kube_store::KubeObjectStore;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockObjectStore;
pub use objects::{
    DesiredStateFn, ManagedObject, NamedObject, ObjectModifier, ObjectResult, ReconcileOutcome, ReconcileReport,
    owner_labels, set_annotation,
};
pub use store::ObjectStore;
