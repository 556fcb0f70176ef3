//! Desired-state records handed to the reconciler.

use crate::error::ReconcileError;
use crds::Seed;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Turns the live object (or a default one carrying only name and namespace)
/// into the desired object.
pub type DesiredStateFn<K> = Arc<dyn Fn(K) -> Result<K, ReconcileError> + Send + Sync>;

/// Kind-agnostic metadata tweak applied after the desired-state function.
pub type ObjectModifier = Arc<dyn Fn(&mut ObjectMeta) + Send + Sync>;

/// A named object of kind `K` and the function computing its desired state.
pub struct NamedObject<K> {
    /// Object name
    pub name: String,
    /// Desired-state function
    pub desired: DesiredStateFn<K>,
}

impl<K> NamedObject<K> {
    /// Pair a name with a desired-state function
    pub fn new<F>(name: impl Into<String>, desired: F) -> Self
    where
        F: Fn(K) -> Result<K, ReconcileError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            desired: Arc::new(desired),
        }
    }
}

impl<K> Clone for NamedObject<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            desired: Arc::clone(&self.desired),
        }
    }
}

impl<K> fmt::Debug for NamedObject<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedObject").field("name", &self.name).finish_non_exhaustive()
    }
}

/// One entry of an ordered desired-state list, tagged by kind.
#[derive(Clone, Debug)]
pub enum ManagedObject {
    /// core/v1 Namespace
    Namespace(NamedObject<Namespace>),
    /// core/v1 ConfigMap
    ConfigMap(NamedObject<ConfigMap>),
    /// core/v1 Secret
    Secret(NamedObject<Secret>),
    /// core/v1 ServiceAccount
    ServiceAccount(NamedObject<ServiceAccount>),
    /// core/v1 Service
    Service(NamedObject<Service>),
    /// apps/v1 Deployment
    Deployment(NamedObject<Deployment>),
    /// rbac/v1 ClusterRole
    ClusterRole(NamedObject<ClusterRole>),
    /// rbac/v1 ClusterRoleBinding
    ClusterRoleBinding(NamedObject<ClusterRoleBinding>),
    /// rbac/v1 Role
    Role(NamedObject<Role>),
    /// rbac/v1 RoleBinding
    RoleBinding(NamedObject<RoleBinding>),
    /// fleet Seed
    Seed(NamedObject<Seed>),
}

impl ManagedObject {
    /// Kind tag
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Namespace(_) => "Namespace",
            Self::ConfigMap(_) => "ConfigMap",
            Self::Secret(_) => "Secret",
            Self::ServiceAccount(_) => "ServiceAccount",
            Self::Service(_) => "Service",
            Self::Deployment(_) => "Deployment",
            Self::ClusterRole(_) => "ClusterRole",
            Self::ClusterRoleBinding(_) => "ClusterRoleBinding",
            Self::Role(_) => "Role",
            Self::RoleBinding(_) => "RoleBinding",
            Self::Seed(_) => "Seed",
        }
    }

    /// Object name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Namespace(o) => &o.name,
            Self::ConfigMap(o) => &o.name,
            Self::Secret(o) => &o.name,
            Self::ServiceAccount(o) => &o.name,
            Self::Service(o) => &o.name,
            Self::Deployment(o) => &o.name,
            Self::ClusterRole(o) => &o.name,
            Self::ClusterRoleBinding(o) => &o.name,
            Self::Role(o) => &o.name,
            Self::RoleBinding(o) => &o.name,
            Self::Seed(o) => &o.name,
        }
    }
}

/// Merge `labels` into the object's labels, overwriting existing keys.
#[must_use]
pub fn owner_labels(labels: BTreeMap<String, String>) -> ObjectModifier {
    Arc::new(move |meta: &mut ObjectMeta| {
        let existing = meta.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in &labels {
            existing.insert(key.clone(), value.clone());
        }
    })
}

/// Set one annotation.
#[must_use]
pub fn set_annotation(key: impl Into<String>, value: impl Into<String>) -> ObjectModifier {
    let (key, value) = (key.into(), value.into());
    Arc::new(move |meta: &mut ObjectMeta| {
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.clone(), value.clone());
    })
}

/// Result of reconciling one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileOutcome {
    /// Live object already matched
    Unchanged,
    /// Object did not exist and was created
    Created,
    /// Object was replaced on the first attempt
    Updated,
    /// Object was written after at least one conflict
    ConflictRetried,
    /// Object could not be reconciled
    Failed,
}

impl ReconcileOutcome {
    /// Label value used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::ConflictRetried => "conflict_retried",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one object in a batch
#[derive(Debug)]
pub struct ObjectResult {
    /// Kind tag
    pub kind: &'static str,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
    /// What happened
    pub outcome: ReconcileOutcome,
    /// Error, set iff `outcome` is [`ReconcileOutcome::Failed`]
    pub error: Option<ReconcileError>,
}

/// Per-object results of a batch, in input order.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// One entry per input object
    pub results: Vec<ObjectResult>,
}

impl ReconcileReport {
    /// Number of failed objects
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome == ReconcileOutcome::Failed).count()
    }

    /// Whether any object failed
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    /// Outcome of the object called `name` of kind `kind`, if present
    #[must_use]
    pub fn outcome(&self, kind: &str, name: &str) -> Option<ReconcileOutcome> {
        self.results
            .iter()
            .find(|r| r.kind == kind && r.name == name)
            .map(|r| r.outcome)
    }

    /// Collapse the report into a single error if anything failed.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Batch`] summarising up to three failures.
    pub fn into_result(self) -> Result<(), ReconcileError> {
        let failed = self.failed();
        if failed == 0 {
            return Ok(());
        }
        let summary = self
            .results
            .iter()
            .filter_map(|r| r.error.as_ref())
            .take(3)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(ReconcileError::Batch {
            failed,
            total: self.results.len(),
            summary,
        })
    }
}
