//! Seed discovery and kubeconfig resolution
//!
//! Seeds come either from `Seed` custom resources in the master cluster or
//! from a static datacenters file. Their kubeconfigs come either from the
//! Secret each `Seed` references or from one kubeconfig file holding a
//! context per seed.

use crate::error::RegistryError;
use crds::{KubeconfigReference, Seed, SeedSpec};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

/// Client config of one seed plus a fingerprint of where it came from.
///
/// A changed `revision` means the seed's connection identity changed and its
/// controllers must be rebuilt.
#[derive(Debug, Clone)]
pub struct SeedClientConfig {
    /// Client config for the seed's API server
    pub config: Config,
    /// Fingerprint of the kubeconfig source
    pub revision: String,
}

/// Lists the seeds of the fleet.
#[async_trait::async_trait]
pub trait SeedsGetter: Send + Sync {
    /// All seeds, keyed by name
    async fn get_seeds(&self) -> Result<BTreeMap<String, Seed>, RegistryError>;
}

/// Resolves the client config of one seed.
#[async_trait::async_trait]
pub trait SeedKubeconfigGetter: Send + Sync {
    /// Client config for `seed`
    async fn get_seed_kubeconfig(&self, seed: &Seed) -> Result<SeedClientConfig, RegistryError>;
}

/// Seeds declared as `Seed` custom resources in one namespace.
#[derive(Clone)]
pub struct CrdSeedsGetter {
    client: Client,
    namespace: String,
    label_selector: Option<String>,
}

impl std::fmt::Debug for CrdSeedsGetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdSeedsGetter")
            .field("namespace", &self.namespace)
            .field("label_selector", &self.label_selector)
            .finish_non_exhaustive()
    }
}

impl CrdSeedsGetter {
    /// List seeds in `namespace`, optionally restricted by a worker label selector
    pub fn new(client: Client, namespace: impl Into<String>, label_selector: Option<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            label_selector,
        }
    }
}

#[async_trait::async_trait]
impl SeedsGetter for CrdSeedsGetter {
    async fn get_seeds(&self) -> Result<BTreeMap<String, Seed>, RegistryError> {
        let api: Api<Seed> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut params = ListParams::default();
        if let Some(selector) = &self.label_selector {
            params = params.labels(selector);
        }
        let seeds = api.list(&params).await?;
        debug!("Listed {} seed(s) in {}", seeds.items.len(), self.namespace);
        Ok(seeds
            .items
            .into_iter()
            .map(|seed| (seed.seed_name().to_string(), seed))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct DatacentersFile {
    #[serde(default)]
    datacenters: BTreeMap<String, DatacenterEntry>,
}

#[derive(Debug, Deserialize)]
struct DatacenterEntry {
    #[serde(default)]
    country: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    seed: bool,
}

/// Seeds read from a static datacenters file.
///
/// ```yaml
/// datacenters:
///   europe-west:
///     country: DE
///     location: Frankfurt
///     seed: true
/// ```
///
/// Only entries with `seed: true` are seeds. Each one uses the kubeconfig
/// context of the same name.
#[derive(Debug, Clone)]
pub struct DatacentersFileSeedsGetter {
    path: PathBuf,
    namespace: String,
}

impl DatacentersFileSeedsGetter {
    /// Read seeds from `path`; they are placed in `namespace`
    pub fn new(path: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            namespace: namespace.into(),
        }
    }
}

/// Parse a datacenters file into seeds.
///
/// # Errors
///
/// Returns [`RegistryError::Datacenters`] if `content` is not a valid datacenters file.
pub fn parse_datacenters(
    path: &str,
    content: &str,
    namespace: &str,
) -> Result<BTreeMap<String, Seed>, RegistryError> {
    let file: DatacentersFile = serde_yaml::from_str(content).map_err(|source| RegistryError::Datacenters {
        path: path.to_string(),
        source,
    })?;
    Ok(file
        .datacenters
        .into_iter()
        .filter(|(_, dc)| dc.seed)
        .map(|(name, dc)| {
            let mut seed = Seed::new(
                &name,
                SeedSpec {
                    country: dc.country,
                    location: dc.location,
                    kubeconfig: KubeconfigReference {
                        context: Some(name.clone()),
                        ..Default::default()
                    },
                },
            );
            seed.metadata.namespace = Some(namespace.to_string());
            (name, seed)
        })
        .collect())
}

#[async_trait::async_trait]
impl SeedsGetter for DatacentersFileSeedsGetter {
    async fn get_seeds(&self) -> Result<BTreeMap<String, Seed>, RegistryError> {
        let path = self.path.display().to_string();
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
        parse_datacenters(&path, &content, &self.namespace)
    }
}

fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Which Secret entry and context a kubeconfig came from, plus the Secret's version
fn secret_revision(namespace: &str, secret_name: &str, key: &str, context: Option<&str>, version: &str) -> String {
    fingerprint(&[namespace, secret_name, key, context.unwrap_or_default(), version])
}

async fn config_from_kubeconfig(seed: &str, content: &str, context: Option<&str>) -> Result<Config, RegistryError> {
    let invalid = |message: String| RegistryError::Kubeconfig {
        seed: seed.to_string(),
        message,
    };
    let kubeconfig = Kubeconfig::from_yaml(content).map_err(|e| invalid(e.to_string()))?;
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| invalid(e.to_string()))
}

/// Kubeconfigs stored in the Secrets referenced by `Seed` resources.
#[derive(Clone)]
pub struct SecretKubeconfigGetter {
    client: Client,
    default_namespace: String,
}

impl std::fmt::Debug for SecretKubeconfigGetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKubeconfigGetter")
            .field("default_namespace", &self.default_namespace)
            .finish_non_exhaustive()
    }
}

impl SecretKubeconfigGetter {
    /// Read Secrets through `client`; Secrets without a namespace are looked
    /// up in the Seed's namespace, then in `default_namespace`
    pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
        }
    }
}

#[async_trait::async_trait]
impl SeedKubeconfigGetter for SecretKubeconfigGetter {
    async fn get_seed_kubeconfig(&self, seed: &Seed) -> Result<SeedClientConfig, RegistryError> {
        let name = seed.seed_name();
        let reference = &seed.spec.kubeconfig;
        let not_found = |message: String| RegistryError::KubeconfigNotFound {
            seed: name.to_string(),
            message,
        };

        let secret_name = reference
            .secret_name
            .as_deref()
            .ok_or_else(|| not_found("no kubeconfig Secret referenced".to_string()))?;
        let namespace = reference
            .namespace
            .as_deref()
            .or(seed.metadata.namespace.as_deref())
            .unwrap_or(&self.default_namespace);

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(secret_name)
            .await?
            .ok_or_else(|| not_found(format!("Secret {namespace}/{secret_name} does not exist")))?;

        let key = reference.key_or_default();
        let data = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .ok_or_else(|| not_found(format!("Secret {namespace}/{secret_name} has no key {key}")))?;
        let content = String::from_utf8(data.0.clone()).map_err(|e| RegistryError::Kubeconfig {
            seed: name.to_string(),
            message: e.to_string(),
        })?;

        let config = config_from_kubeconfig(name, &content, reference.context.as_deref()).await?;
        let version = secret.metadata.resource_version.clone().unwrap_or_else(|| fingerprint(&[&content]));
        let revision = secret_revision(namespace, secret_name, key, reference.context.as_deref(), &version);
        Ok(SeedClientConfig { config, revision })
    }
}

/// One kubeconfig file with a context per seed, named after the seed.
#[derive(Debug, Clone)]
pub struct KubeconfigFileGetter {
    path: PathBuf,
}

impl KubeconfigFileGetter {
    /// Read contexts from the kubeconfig at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl SeedKubeconfigGetter for KubeconfigFileGetter {
    async fn get_seed_kubeconfig(&self, seed: &Seed) -> Result<SeedClientConfig, RegistryError> {
        let name = seed.seed_name();
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| RegistryError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        let context = seed.spec.kubeconfig.context.as_deref().unwrap_or(name);
        let config = config_from_kubeconfig(name, &content, Some(context)).await?;
        Ok(SeedClientConfig {
            config,
            revision: fingerprint(&[context, &content]),
        })
    }
}

/// Outcome of one resolution pass.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Every seed the getter returned
    pub seeds: BTreeMap<String, Seed>,
    /// Seeds whose kubeconfig resolved
    pub configs: BTreeMap<String, SeedClientConfig>,
    /// Seeds whose kubeconfig failed, with the reason
    pub failures: BTreeMap<String, RegistryError>,
}

/// Combines a seeds getter and a kubeconfig getter.
#[derive(Clone)]
pub struct SeedRegistry {
    seeds: Arc<dyn SeedsGetter>,
    kubeconfigs: Arc<dyn SeedKubeconfigGetter>,
}

impl std::fmt::Debug for SeedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedRegistry").finish_non_exhaustive()
    }
}

impl SeedRegistry {
    /// Build a registry from its two getters
    pub fn new(seeds: Arc<dyn SeedsGetter>, kubeconfigs: Arc<dyn SeedKubeconfigGetter>) -> Self {
        Self { seeds, kubeconfigs }
    }

    /// Fetch all seeds and resolve every kubeconfig concurrently.
    ///
    /// A failing kubeconfig only affects its own seed.
    ///
    /// # Errors
    ///
    /// Returns the getter's error if the seed list cannot be fetched.
    pub async fn resolve(&self) -> Result<Resolution, RegistryError> {
        let seeds = self.seeds.get_seeds().await?;
        let lookups = seeds.iter().map(|(name, seed)| async move {
            (name.clone(), self.kubeconfigs.get_seed_kubeconfig(seed).await)
        });
        let results = join_all(lookups).await;

        let mut resolution = Resolution::default();
        for (name, result) in results {
            match result {
                Ok(config) => {
                    resolution.configs.insert(name, config);
                }
                Err(e) => {
                    error!(seed = %name, error = %e, "Failed to resolve seed kubeconfig");
                    resolution.failures.insert(name, e);
                }
            }
        }
        resolution.seeds = seeds;
        Ok(resolution)
    }
}
