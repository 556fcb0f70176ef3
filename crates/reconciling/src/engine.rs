//! Declarative object reconciler
//!
//! Drives objects toward a caller-supplied desired state:
//!
//! 1. GET the live object.
//! 2. Absent: build a default object carrying only name and namespace, apply
//!    the desired-state function and the modifiers, create it. A concurrent
//!    creator (`AlreadyExists`) sends us back to 1.
//! 3. Present: apply the desired-state function and the modifiers to a copy.
//!    Semantically equal to the live object means nothing to do, otherwise
//!    replace it using the live `resourceVersion`.
//! 4. Conflict: back to 1, up to `max_attempts` attempts in total.
//!
//! The desired-state function always sees the live object, so `status` and
//! server-populated metadata pass through untouched.

use crate::error::{ReconcileError, StoreError};
use crate::kind::{ManagedKind, describe};
use crate::objects::{
    DesiredStateFn, ManagedObject, NamedObject, ObjectModifier, ObjectResult, ReconcileOutcome, ReconcileReport,
};
use crate::store::ObjectStore;
use tracing::{debug, info, warn};

/// Default number of attempts before an update conflict becomes a failure.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Reconciles objects in one cluster through an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ObjectReconciler<S> {
    store: S,
    max_attempts: u32,
}

enum Attempt {
    Done(ReconcileOutcome),
    Retry,
}

impl<S: ObjectStore> ObjectReconciler<S> {
    /// Create a reconciler with the default attempt bound
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the attempt bound (at least one attempt is always made)
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Store this reconciler writes through
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Ensure one object of kind `K` matches its desired state.
    ///
    /// # Errors
    ///
    /// * [`ReconcileError::Api`] when the store rejects a read or write
    /// * [`ReconcileError::ConflictRetriesExhausted`] when every attempt conflicted
    /// * [`ReconcileError::Desired`] / [`ReconcileError::IdentityChanged`] when the
    ///   desired-state function fails or renames the object
    pub async fn ensure<K: ManagedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        desired: &DesiredStateFn<K>,
        modifiers: &[ObjectModifier],
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let namespace = if K::NAMESPACED { namespace } else { None };
        let object = describe::<K>(namespace, name);
        let api_error = |source: StoreError| ReconcileError::Api {
            object: object.clone(),
            source,
        };

        let mut conflicted = false;
        for attempt in 1..=self.max_attempts {
            let live = self.store.get::<K>(namespace, name).await.map_err(api_error)?;
            let result = match live {
                None => self.create_attempt(namespace, name, &object, desired, modifiers).await?,
                Some(live) => self.update_attempt(namespace, name, &object, live, desired, modifiers).await?,
            };
            match result {
                Attempt::Done(outcome) => {
                    let outcome = match outcome {
                        ReconcileOutcome::Created | ReconcileOutcome::Updated if conflicted => {
                            ReconcileOutcome::ConflictRetried
                        }
                        other => other,
                    };
                    debug!("{} reconciled ({}) after {} attempt(s)", object, outcome, attempt);
                    return Ok(outcome);
                }
                Attempt::Retry => {
                    conflicted = true;
                    debug!("Conflict on {} (attempt {}/{}), re-reading", object, attempt, self.max_attempts);
                }
            }
        }

        warn!("Giving up on {} after {} conflicting attempts", object, self.max_attempts);
        Err(ReconcileError::ConflictRetriesExhausted {
            object,
            attempts: self.max_attempts,
        })
    }

    async fn create_attempt<K: ManagedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: &str,
        desired: &DesiredStateFn<K>,
        modifiers: &[ObjectModifier],
    ) -> Result<Attempt, ReconcileError> {
        let mut base = K::default();
        base.meta_mut().name = Some(name.to_string());
        base.meta_mut().namespace = namespace.map(str::to_string);
        let wanted = build_desired(base, namespace, name, object, desired, modifiers)?;

        match self.store.create(namespace, &wanted).await {
            Ok(_) => {
                info!("Created {}", object);
                Ok(Attempt::Done(ReconcileOutcome::Created))
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!("{} was created concurrently, re-reading", object);
                Ok(Attempt::Retry)
            }
            Err(source) => Err(ReconcileError::Api {
                object: object.to_string(),
                source,
            }),
        }
    }

    async fn update_attempt<K: ManagedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: &str,
        live: K,
        desired: &DesiredStateFn<K>,
        modifiers: &[ObjectModifier],
    ) -> Result<Attempt, ReconcileError> {
        let resource_version = live.meta().resource_version.clone();
        let mut wanted = build_desired(live.clone(), namespace, name, object, desired, modifiers)?;
        if wanted.semantic_eq(&live) {
            return Ok(Attempt::Done(ReconcileOutcome::Unchanged));
        }
        wanted.meta_mut().resource_version = resource_version;

        match self.store.replace(namespace, &wanted).await {
            Ok(_) => {
                info!("Updated {}", object);
                Ok(Attempt::Done(ReconcileOutcome::Updated))
            }
            Err(StoreError::Conflict(_)) => Ok(Attempt::Retry),
            Err(source) => Err(ReconcileError::Api {
                object: object.to_string(),
                source,
            }),
        }
    }

    /// Reconcile an ordered list of objects.
    ///
    /// Every object is attempted regardless of earlier failures; the report
    /// carries one entry per object, in input order.
    pub async fn reconcile_objects(
        &self,
        namespace: Option<&str>,
        objects: &[ManagedObject],
        modifiers: &[ObjectModifier],
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for managed in objects {
            let kind = managed.kind();
            let result = match managed {
                ManagedObject::Namespace(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::ConfigMap(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::Secret(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::ServiceAccount(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::Service(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::Deployment(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::ClusterRole(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::ClusterRoleBinding(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::Role(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::RoleBinding(o) => self.ensure_named(kind, namespace, o, modifiers).await,
                ManagedObject::Seed(o) => self.ensure_named(kind, namespace, o, modifiers).await,
            };
            report.results.push(result);
        }
        report
    }

    async fn ensure_named<K: ManagedKind>(
        &self,
        kind: &'static str,
        namespace: Option<&str>,
        object: &NamedObject<K>,
        modifiers: &[ObjectModifier],
    ) -> ObjectResult {
        let namespace = if K::NAMESPACED { namespace } else { None };
        let (outcome, error) = match self.ensure(namespace, &object.name, &object.desired, modifiers).await {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                warn!("Failed to reconcile {}: {}", describe::<K>(namespace, &object.name), e);
                (ReconcileOutcome::Failed, Some(e))
            }
        };
        ObjectResult {
            kind,
            namespace: namespace.map(str::to_string),
            name: object.name.clone(),
            outcome,
            error,
        }
    }
}

fn build_desired<K: ManagedKind>(
    base: K,
    namespace: Option<&str>,
    name: &str,
    object: &str,
    desired: &DesiredStateFn<K>,
    modifiers: &[ObjectModifier],
) -> Result<K, ReconcileError> {
    let mut wanted = desired(base).map_err(|e| e.for_object(object))?;
    for modifier in modifiers {
        modifier(wanted.meta_mut());
    }

    let meta = wanted.meta_mut();
    if meta.name.as_deref() != Some(name) {
        return Err(ReconcileError::IdentityChanged {
            object: object.to_string(),
        });
    }
    if K::NAMESPACED {
        match meta.namespace.as_deref() {
            None => meta.namespace = namespace.map(str::to_string),
            found if found != namespace => {
                return Err(ReconcileError::IdentityChanged {
                    object: object.to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockObjectStore;
    use crate::objects::{owner_labels, set_annotation};
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace, NamespaceStatus};
    use k8s_openapi::api::rbac::v1::ClusterRole;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn config_data(entries: &[(&str, &str)]) -> DesiredStateFn<ConfigMap> {
        let data: BTreeMap<String, String> = entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Arc::new(move |mut cm: ConfigMap| {
            cm.data = Some(data.clone());
            Ok(cm)
        })
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let store = MockObjectStore::new();
        let reconciler = ObjectReconciler::new(store.clone());
        let desired = config_data(&[("region", "eu")]);

        let first = reconciler.ensure(Some("fleet"), "settings", &desired, &[]).await.unwrap();
        let second = reconciler.ensure(Some("fleet"), "settings", &desired, &[]).await.unwrap();

        assert_eq!(first, ReconcileOutcome::Created);
        assert_eq!(second, ReconcileOutcome::Unchanged);
        assert_eq!(store.writes(), 1);
        let stored = store.object::<ConfigMap>(Some("fleet"), "settings").unwrap();
        assert_eq!(stored.metadata.namespace.as_deref(), Some("fleet"));
    }

    #[tokio::test]
    async fn test_ensure_updates_drifted_object() {
        let store = MockObjectStore::new();
        let reconciler = ObjectReconciler::new(store.clone());
        reconciler
            .ensure(Some("fleet"), "settings", &config_data(&[("region", "eu")]), &[])
            .await
            .unwrap();

        let outcome = reconciler
            .ensure(Some("fleet"), "settings", &config_data(&[("region", "us")]), &[])
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated);
        let stored = store.object::<ConfigMap>(Some("fleet"), "settings").unwrap();
        assert_eq!(stored.data.unwrap()["region"], "us");
        assert_eq!(store.replaces(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_converge_within_bound() {
        let store = MockObjectStore::new();
        let reconciler = ObjectReconciler::new(store.clone()).with_max_attempts(5);
        reconciler
            .ensure(Some("fleet"), "settings", &config_data(&[("a", "1")]), &[])
            .await
            .unwrap();

        store.inject_conflicts(4);
        let outcome = reconciler
            .ensure(Some("fleet"), "settings", &config_data(&[("a", "2")]), &[])
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::ConflictRetried);
        let stored = store.object::<ConfigMap>(Some("fleet"), "settings").unwrap();
        assert_eq!(stored.data.unwrap()["a"], "2");
    }

    #[tokio::test]
    async fn test_conflicts_past_bound_fail_deterministically() {
        let store = MockObjectStore::new();
        let reconciler = ObjectReconciler::new(store.clone()).with_max_attempts(3);
        reconciler
            .ensure(Some("fleet"), "settings", &config_data(&[("a", "1")]), &[])
            .await
            .unwrap();

        store.inject_conflicts(3);
        let err = reconciler
            .ensure(Some("fleet"), "settings", &config_data(&[("a", "2")]), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::ConflictRetriesExhausted { attempts: 3, .. }));
        let stored = store.object::<ConfigMap>(Some("fleet"), "settings").unwrap();
        assert_eq!(stored.data.unwrap()["a"], "1");
    }

    #[tokio::test]
    async fn test_status_and_uid_are_preserved() {
        let store = MockObjectStore::new();
        let mut live = Namespace::default();
        live.metadata.name = Some("tenant-a".to_string());
        live.metadata.uid = Some("uid-original".to_string());
        live.status = Some(NamespaceStatus {
            phase: Some("Active".to_string()),
            ..Default::default()
        });
        store.insert(None, &live);

        let reconciler = ObjectReconciler::new(store.clone());
        let labels = owner_labels(BTreeMap::from([("fleet.microscaler.io/owner".to_string(), "rbac".to_string())]));
        let desired: DesiredStateFn<Namespace> = Arc::new(|ns: Namespace| Ok(ns));
        let outcome = reconciler.ensure(None, "tenant-a", &desired, &[labels]).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated);
        let stored = store.object::<Namespace>(None, "tenant-a").unwrap();
        assert_eq!(stored.metadata.uid.as_deref(), Some("uid-original"));
        assert_eq!(stored.status.unwrap().phase.as_deref(), Some("Active"));
        assert_eq!(stored.metadata.labels.unwrap()["fleet.microscaler.io/owner"], "rbac");
    }

    #[tokio::test]
    async fn test_identity_change_is_rejected() {
        let store = MockObjectStore::new();
        let reconciler = ObjectReconciler::new(store.clone());
        let rename: DesiredStateFn<ConfigMap> = Arc::new(|mut cm: ConfigMap| {
            cm.metadata.name = Some("other".to_string());
            Ok(cm)
        });

        let err = reconciler.ensure(Some("fleet"), "settings", &rename, &[]).await.unwrap_err();

        assert!(matches!(err, ReconcileError::IdentityChanged { .. }));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let store = MockObjectStore::new();
        store.inject_error("broken", "admission webhook denied the request");
        let reconciler = ObjectReconciler::new(store.clone());
        let objects = vec![
            ManagedObject::ConfigMap(NamedObject::new("broken", |cm: ConfigMap| Ok(cm))),
            ManagedObject::ConfigMap(NamedObject { name: "healthy".to_string(), desired: config_data(&[("k", "v")]) }),
            ManagedObject::ClusterRole(NamedObject::new("viewer", |role: ClusterRole| Ok(role))),
        ];

        let report = reconciler
            .reconcile_objects(Some("fleet"), &objects, &[set_annotation("fleet.microscaler.io/batch", "1")])
            .await;

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.outcome("ConfigMap", "broken"), Some(ReconcileOutcome::Failed));
        assert_eq!(report.outcome("ConfigMap", "healthy"), Some(ReconcileOutcome::Created));
        assert_eq!(report.outcome("ClusterRole", "viewer"), Some(ReconcileOutcome::Created));
        assert!(report.results[2].namespace.is_none());
        assert_eq!(report.failed(), 1);
        assert!(store.object::<ClusterRole>(None, "viewer").is_some());
    }

    #[tokio::test]
    async fn test_desired_error_reports_failed() {
        let store = MockObjectStore::new();
        let reconciler = ObjectReconciler::new(store.clone());
        let objects = vec![ManagedObject::ConfigMap(NamedObject::new("settings", |_cm: ConfigMap| {
            Err(ReconcileError::desired("no region configured"))
        }))];

        let report = reconciler.reconcile_objects(Some("fleet"), &objects, &[]).await;

        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("no region configured"));
        assert_eq!(store.writes(), 0);
    }
}
