//! Seed CRD
//!
//! Declares one managed remote cluster. The master controller manager resolves
//! every `Seed` in its namespace, fetches the referenced kubeconfig and runs
//! controllers against the seed.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label used to shard seeds between several master controller managers.
pub const WORKER_NAME_LABEL: &str = "worker-name";

/// Default key of the kubeconfig inside the referenced Secret.
pub const DEFAULT_KUBECONFIG_KEY: &str = "kubeconfig";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "fleet.microscaler.io",
    version = "v1alpha1",
    kind = "Seed",
    namespaced,
    status = "SeedStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Country","type":"string","jsonPath":".spec.country"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SeedSpec {
    /// Country code of the datacenter hosting the seed (e.g. "DE")
    #[serde(default)]
    pub country: String,

    /// Free-form location description (e.g. "Frankfurt")
    #[serde(default)]
    pub location: String,

    /// Where the kubeconfig for this seed lives
    #[serde(default)]
    pub kubeconfig: KubeconfigReference,
}

/// Reference to the kubeconfig used to reach a seed.
///
/// Seeds declared as custom resources point at a Secret; seeds loaded from a
/// datacenters file use the context of the same name in the master kubeconfig
/// and leave this empty.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigReference {
    /// Name of the Secret holding the kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Namespace of the Secret (defaults to the Seed's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Key inside the Secret (defaults to "kubeconfig")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Kubeconfig context to use (defaults to the current context)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl KubeconfigReference {
    /// Key inside the Secret, falling back to [`DEFAULT_KUBECONFIG_KEY`].
    #[must_use]
    pub fn key_or_default(&self) -> &str {
        self.key.as_deref().unwrap_or(DEFAULT_KUBECONFIG_KEY)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedStatus {
    /// Health of the seed as last observed by the lifecycle manager
    #[serde(default)]
    pub phase: SeedPhase,

    /// Error from the last failed resolution or bring-up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Last time the lifecycle manager evaluated this seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Seed health
///
/// Serializes as PascalCase ("Healthy", "Unreachable"), matching the
/// convention of the other fleet CRDs.
#[serde(rename_all = "PascalCase")]
pub enum SeedPhase {
    /// Not evaluated yet
    #[default]
    Unknown,

    /// Kubeconfig resolved and controllers running
    Healthy,

    /// Kubeconfig missing/invalid or the cluster could not be brought up
    Unreachable,
}

impl Seed {
    /// Seed name, empty if the object carries no name.
    #[must_use]
    pub fn seed_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}
