//! Object kinds the engine knows how to reconcile.

use crds::Seed;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;

/// Metadata fields the API server owns. They never count as drift.
const SERVER_OWNED_METADATA: [&str; 7] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "managedFields",
    "generation",
    "selfLink",
    "deletionTimestamp",
];

/// A Kubernetes kind the [`ObjectReconciler`](crate::ObjectReconciler) can ensure.
///
/// The default [`semantic_eq`](ManagedKind::semantic_eq) compares the JSON form of
/// both objects with `status` and server-owned metadata removed.
pub trait ManagedKind:
    Resource<DynamicType = ()> + Clone + Default + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
    /// Whether objects of this kind live inside a namespace
    const NAMESPACED: bool;

    /// Whether `self` and `other` describe the same desired state.
    ///
    /// Serialization failures count as "different" so the object gets rewritten.
    fn semantic_eq(&self, other: &Self) -> bool {
        match (comparable(self), comparable(other)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

fn comparable<K: Serialize>(object: &K) -> Option<Value> {
    let mut value = serde_json::to_value(object).ok()?;
    if let Value::Object(map) = &mut value {
        map.remove("status");
        if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
            for field in SERVER_OWNED_METADATA {
                metadata.remove(field);
            }
        }
    }
    Some(value)
}

/// Human readable `Kind namespace/name` used in logs and errors.
#[must_use]
pub fn describe<K: ManagedKind>(namespace: Option<&str>, name: &str) -> String {
    let kind = K::kind(&());
    match namespace {
        Some(ns) if K::NAMESPACED => format!("{kind} {ns}/{name}"),
        _ => format!("{kind} {name}"),
    }
}

macro_rules! managed_kind {
    ($namespaced:expr => $($kind:ty),+ $(,)?) => {
        $(
            impl ManagedKind for $kind {
                const NAMESPACED: bool = $namespaced;
            }
        )+
    };
}

managed_kind!(true => ConfigMap, Secret, ServiceAccount, Service, Deployment, Role, RoleBinding, Seed);
managed_kind!(false => Namespace, ClusterRole, ClusterRoleBinding);
