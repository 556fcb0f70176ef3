//! Seed controller lifecycle
//!
//! Every pass resolves the seed set, tears down seeds that disappeared, whose
//! kubeconfig now fails or whose kubeconfig changed, and brings up seeds that
//! are not running yet. A seed that cannot be brought up is excluded for that
//! pass only; other seeds are unaffected.
//!
//! ```text
//! Unknown -> Provisioning -> Running
//!                  |            |
//!                  v            v
//!              Excluded <- (kubeconfig failing)
//! ```

use crate::error::{LifecycleError, RegistryError};
use crate::manager::{ControllerFactory, ControllerManager, ControllerSettings, FactoryScope, ManagerScope};
use crate::metrics::SeedLifecycleMetrics;
use crate::provider::{ClusterConnection, ClusterName, ClusterProvider};
use crate::registry::{SeedClientConfig, SeedRegistry};
use crds::{Seed, SeedPhase, SeedStatus};
use futures::future::join_all;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one seed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SeedState {
    /// Not evaluated yet
    Unknown,
    /// Being brought up in the current pass
    Provisioning,
    /// Controllers running
    Running,
    /// Skipped for the current pass
    Excluded,
}

impl SeedState {
    /// All states, for metrics
    pub const ALL: [SeedState; 4] = [Self::Unknown, Self::Provisioning, Self::Running, Self::Excluded];

    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Excluded => "excluded",
        }
    }

    /// Phase written to the Seed status
    #[must_use]
    pub fn phase(&self) -> SeedPhase {
        match self {
            Self::Unknown | Self::Provisioning => SeedPhase::Unknown,
            Self::Running => SeedPhase::Healthy,
            Self::Excluded => SeedPhase::Unreachable,
        }
    }
}

impl fmt::Display for SeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes the outcome of a pass for one seed.
#[async_trait::async_trait]
pub trait SeedStatusReporter: Send + Sync {
    /// Record `state` (and the failure, if any) for `seed`
    async fn report(&self, seed: &Seed, state: SeedState, error: Option<String>) -> Result<(), RegistryError>;
}

/// Writes the seed state into the `status` subresource of `Seed` objects.
#[derive(Clone)]
pub struct KubeSeedStatusReporter {
    client: Client,
}

impl fmt::Debug for KubeSeedStatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeSeedStatusReporter").finish_non_exhaustive()
    }
}

impl KubeSeedStatusReporter {
    /// Reporter writing through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl SeedStatusReporter for KubeSeedStatusReporter {
    async fn report(&self, seed: &Seed, state: SeedState, error: Option<String>) -> Result<(), RegistryError> {
        let namespace = seed.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<Seed> = Api::namespaced(self.client.clone(), namespace);
        let status = SeedStatus {
            phase: state.phase(),
            error,
            last_evaluated: Some(chrono::Utc::now()),
        };
        let patch = serde_json::json!({ "status": status });
        api.patch_status(seed.seed_name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

struct RunningSeed {
    revision: String,
    connection: ClusterConnection,
    manager: ControllerManager,
}

struct MasterManager {
    fingerprint: Vec<(String, String)>,
    manager: ControllerManager,
}

/// Keeps one controller manager per reachable seed.
pub struct SeedLifecycleManager {
    master: ClusterConnection,
    registry: SeedRegistry,
    factories: Vec<Arc<dyn ControllerFactory>>,
    settings: ControllerSettings,
    metrics: Arc<SeedLifecycleMetrics>,
    reporter: Option<Arc<dyn SeedStatusReporter>>,
    running: BTreeMap<String, RunningSeed>,
    master_manager: Option<MasterManager>,
    states: Arc<Mutex<BTreeMap<String, SeedState>>>,
    trigger: Arc<Notify>,
}

impl fmt::Debug for SeedLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedLifecycleManager")
            .field("master", &self.master)
            .field("factories", &self.factories.len())
            .field("running", &self.running.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SeedLifecycleManager {
    /// Create a manager; nothing runs until the first pass
    pub fn new(
        master: ClusterConnection,
        registry: SeedRegistry,
        factories: Vec<Arc<dyn ControllerFactory>>,
        settings: ControllerSettings,
        metrics: Arc<SeedLifecycleMetrics>,
    ) -> Self {
        Self {
            master,
            registry,
            factories,
            settings,
            metrics,
            reporter: None,
            running: BTreeMap::new(),
            master_manager: None,
            states: Arc::new(Mutex::new(BTreeMap::new())),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Publish per-seed state after every pass
    #[must_use]
    pub fn with_status_reporter(mut self, reporter: Arc<dyn SeedStatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Snapshot of every seed's state after the last pass
    pub fn states(&self) -> BTreeMap<String, SeedState> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Shared state map, readable while a pass is running
    pub fn state_handle(&self) -> Arc<Mutex<BTreeMap<String, SeedState>>> {
        Arc::clone(&self.states)
    }

    /// Notifying this runs a pass right away
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Names of seeds whose controllers are running
    pub fn running_seeds(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    /// Controller manager of a running seed
    pub fn seed_manager(&self, seed: &str) -> Option<&ControllerManager> {
        self.running.get(seed).map(|running| &running.manager)
    }

    /// The master-scoped manager, if master factories are installed
    pub fn master_manager(&self) -> Option<&ControllerManager> {
        self.master_manager.as_ref().map(|master| &master.manager)
    }

    fn set_states(&self, update: impl FnOnce(&mut BTreeMap<String, SeedState>)) {
        update(&mut self.states.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Run one lifecycle pass.
    ///
    /// # Errors
    ///
    /// Returns the registry error when the seed list cannot be fetched; the
    /// running seeds are left untouched in that case.
    pub async fn reconcile_seeds(&mut self, token: &CancellationToken) -> Result<(), RegistryError> {
        let resolution = match self.registry.resolve().await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.metrics.passes.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };
        let seeds = resolution.seeds;
        let configs = resolution.configs;
        let mut errors: BTreeMap<String, String> = resolution
            .failures
            .into_iter()
            .map(|(name, e)| (name, e.to_string()))
            .collect();

        // Removed seeds, failing kubeconfigs and changed kubeconfigs
        let stale: Vec<String> = self
            .running
            .iter()
            .filter(|(name, running)| configs.get(*name).is_none_or(|config| config.revision != running.revision))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(mut running) = self.running.remove(&name) {
                if seeds.contains_key(&name) {
                    info!(seed = %name, "Seed connection changed or failing, stopping its controllers");
                } else {
                    info!(seed = %name, "Seed removed, stopping its controllers");
                }
                running.manager.stop(self.settings.shutdown_timeout).await;
            }
        }

        let pending: Vec<(String, Seed, SeedClientConfig)> = configs
            .into_iter()
            .filter(|(name, _)| !self.running.contains_key(name))
            .filter_map(|(name, config)| seeds.get(&name).map(|seed| (name, seed.clone(), config)))
            .collect();

        self.set_states(|states| {
            states.retain(|name, _| seeds.contains_key(name));
            for name in seeds.keys() {
                states.entry(name.clone()).or_insert(SeedState::Unknown);
            }
            for (name, _, _) in &pending {
                states.insert(name.clone(), SeedState::Provisioning);
            }
        });

        let master = &self.master;
        let factories = &self.factories;
        let settings = &self.settings;
        let provisioned = join_all(pending.into_iter().map(|(name, seed, config)| async move {
            let revision = config.revision.clone();
            let result = provision_seed(master, factories, settings, token, &name, seed, config).await;
            (name, revision, result)
        }))
        .await;

        for (name, revision, result) in provisioned {
            match result {
                Ok(manager) => {
                    info!(seed = %name, "Seed controllers running");
                    let connection = manager.primary().connection();
                    self.running.insert(
                        name,
                        RunningSeed {
                            revision,
                            connection,
                            manager,
                        },
                    );
                }
                Err(e) => {
                    error!(seed = %name, error = %e, "Failed to bring up seed, excluding it for this pass");
                    errors.insert(name, e.to_string());
                }
            }
        }

        let snapshot: BTreeMap<String, bool> = seeds
            .keys()
            .map(|name| (name.clone(), self.running.contains_key(name)))
            .collect();
        self.set_states(|states| {
            for (name, running) in &snapshot {
                let state = if *running { SeedState::Running } else { SeedState::Excluded };
                states.insert(name.clone(), state);
            }
        });
        self.metrics.seed_kubeconfig.apply(&snapshot);
        self.record_state_counts();

        self.refresh_master_manager(token).await;

        if let Some(reporter) = &self.reporter {
            let states = self.states();
            let reports = seeds.iter().map(|(name, seed)| {
                let state = states.get(name).copied().unwrap_or(SeedState::Unknown);
                let error = errors.get(name).cloned();
                async move {
                    if let Err(e) = reporter.report(seed, state, error).await {
                        warn!(seed = %name, error = %e, "Failed to update seed status");
                    }
                }
            });
            join_all(reports).await;
        }

        self.metrics.passes.with_label_values(&["ok"]).inc();
        debug!(
            "Lifecycle pass done: {} seed(s), {} running, {} excluded",
            seeds.len(),
            self.running.len(),
            seeds.len() - self.running.len()
        );
        Ok(())
    }

    fn record_state_counts(&self) {
        let states = self.states();
        for state in SeedState::ALL {
            let count = states.values().filter(|s| **s == state).count();
            self.metrics
                .seeds
                .with_label_values(&[state.as_str()])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    /// Rebuild the master-scoped manager when the running seed set changed
    async fn refresh_master_manager(&mut self, token: &CancellationToken) {
        let master_factories: Vec<&Arc<dyn ControllerFactory>> = self
            .factories
            .iter()
            .filter(|factory| factory.scope() == FactoryScope::Master)
            .collect();
        if master_factories.is_empty() {
            return;
        }

        let fingerprint: Vec<(String, String)> = self
            .running
            .iter()
            .map(|(name, running)| (name.clone(), running.revision.clone()))
            .collect();
        if self
            .master_manager
            .as_ref()
            .is_some_and(|current| current.fingerprint == fingerprint)
        {
            return;
        }

        if let Some(mut previous) = self.master_manager.take() {
            info!("Running seeds changed, restarting master controllers");
            previous.manager.stop(self.settings.shutdown_timeout).await;
        }

        let connections: Vec<ClusterConnection> = self.running.values().map(|r| r.connection.clone()).collect();
        let provider = ClusterProvider::from_client(
            self.master.name.clone(),
            self.master.client.clone(),
            self.settings.resync_interval,
            self.settings.label_selector.clone(),
        );
        let mut manager = ControllerManager::new(ManagerScope::Master, self.master.clone(), provider, self.settings.clone())
            .with_seed_connections(connections);

        for factory in master_factories {
            match factory.install(&mut manager).await {
                Ok(name) => debug!("Installed {} on {}", name, self.master.name),
                Err(e) => {
                    error!(cluster = %self.master.name, error = %e, "Failed to install master controller");
                    return;
                }
            }
        }
        if let Err(e) = manager.start(token, self.settings.cache_sync_timeout).await {
            error!(cluster = %self.master.name, error = %e, "Failed to start master controllers");
            return;
        }
        self.master_manager = Some(MasterManager { fingerprint, manager });
    }

    /// Stop every manager this lifecycle manager started
    pub async fn shutdown(&mut self) {
        let timeout = self.settings.shutdown_timeout;
        if let Some(mut master) = self.master_manager.take() {
            master.manager.stop(timeout).await;
        }
        join_all(self.running.values_mut().map(|running| running.manager.stop(timeout))).await;
        self.running.clear();
        self.metrics.seed_kubeconfig.apply(&BTreeMap::new());
        self.set_states(BTreeMap::clear);
        info!("Seed lifecycle stopped");
    }

    /// Run passes until `token` is cancelled, then stop everything.
    ///
    /// A pass runs immediately, then every resync interval and whenever the
    /// [`trigger`](Self::trigger) is notified.
    pub async fn run(&mut self, token: CancellationToken) {
        loop {
            if let Err(e) = self.reconcile_seeds(&token).await {
                error!(error = %e, "Seed lifecycle pass failed");
            }
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.settings.resync_interval) => {}
                () = self.trigger.notified() => debug!("Seed change observed, running lifecycle pass"),
            }
        }
        self.shutdown().await;
    }
}

/// Selector matching only the fleet namespace of a seed
#[must_use]
pub fn fleet_namespace_selector(namespace: &str) -> String {
    format!("kubernetes.io/metadata.name={namespace}")
}

/// Bring up the controllers of one seed
async fn provision_seed(
    master: &ClusterConnection,
    factories: &[Arc<dyn ControllerFactory>],
    settings: &ControllerSettings,
    token: &CancellationToken,
    name: &str,
    seed: Seed,
    config: SeedClientConfig,
) -> Result<ControllerManager, LifecycleError> {
    let cluster = ClusterName::seed(name);
    let mut provider = ClusterProvider::new(
        cluster.clone(),
        config.config,
        settings.resync_interval,
        settings.label_selector.clone(),
    )?;
    // Every seed syncs at least this cache, so an unreachable seed fails here
    let _fleet_namespace = provider.informer_with_labels::<Namespace>(&fleet_namespace_selector(&settings.namespace));
    let mut manager = ControllerManager::new(
        ManagerScope::Seed(name.to_string()),
        master.clone(),
        provider,
        settings.clone(),
    )
    .with_seed(seed);

    for factory in factories.iter().filter(|f| f.scope() == FactoryScope::PerSeed) {
        let installed = factory
            .install(&mut manager)
            .await
            .map_err(|source| LifecycleError::Factory {
                cluster: cluster.clone(),
                source,
            })?;
        debug!("Installed {} on {}", installed, cluster);
    }

    manager.start(token, settings.cache_sync_timeout).await?;
    Ok(manager)
}

/// Notify `trigger` on every change of a `Seed` in `namespace`.
///
/// The watch stops when `token` is cancelled.
pub fn spawn_seed_watch(
    client: Client,
    namespace: &str,
    label_selector: Option<String>,
    trigger: Arc<Notify>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let api: Api<Seed> = Api::namespaced(client, namespace);
    let mut config = watcher::Config::default();
    if let Some(selector) = &label_selector {
        config = config.labels(selector);
    }
    tokio::spawn(async move {
        let events = watcher(api, config).default_backoff().touched_objects().for_each(|event| {
            match event {
                Ok(seed) => {
                    debug!(seed = %seed.seed_name(), "Seed changed");
                    trigger.notify_one();
                }
                Err(e) => warn!(error = %e, "Seed watch error"),
            }
            futures::future::ready(())
        });
        tokio::select! {
            () = token.cancelled() => {}
            () = events => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_phase_mapping() {
        assert_eq!(SeedState::Running.phase(), SeedPhase::Healthy);
        assert_eq!(SeedState::Excluded.phase(), SeedPhase::Unreachable);
        assert_eq!(SeedState::Provisioning.phase(), SeedPhase::Unknown);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SeedState::Excluded.to_string(), "excluded");
        assert_eq!(SeedState::ALL.len(), 4);
    }

    #[test]
    fn test_fleet_namespace_selector() {
        assert_eq!(fleet_namespace_selector("kubermatic"), "kubernetes.io/metadata.name=kubermatic");
    }
}
