//! Controller manager and controller factories
//!
//! A `ControllerManager` targets one cluster: it owns that cluster's
//! [`ClusterProvider`], any extra providers its controllers registered, and the
//! named runnables. Starting it starts every provider's informers, waits for
//! all caches and only then spawns the runnables.

use crate::error::{FactoryError, ManagerError, ProviderError};
use crate::provider::{ClusterConnection, ClusterName, ClusterProvider};
use crds::Seed;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type runnables may return
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A long-running controller loop.
///
/// `run` must return promptly once `token` is cancelled.
#[async_trait::async_trait]
pub trait Runnable: Send {
    /// Run until cancelled or failed
    async fn run(self: Box<Self>, token: CancellationToken) -> Result<(), BoxError>;
}

/// [`Runnable`] built from a closure
pub struct RunnableFn<F> {
    f: F,
}

impl<F> std::fmt::Debug for RunnableFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RunnableFn")
    }
}

/// Wrap a closure into a boxed [`Runnable`]
pub fn runnable_fn<F, Fut>(f: F) -> Box<dyn Runnable>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Box::new(RunnableFn { f })
}

#[async_trait::async_trait]
impl<F, Fut> Runnable for RunnableFn<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn run(self: Box<Self>, token: CancellationToken) -> Result<(), BoxError> {
        (self.f)(token).await
    }
}

/// Which cluster a manager targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerScope {
    /// The master cluster, with the connections of every running seed
    Master,
    /// One seed
    Seed(String),
}

/// Settings shared by every controller a manager hosts.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Namespace of the fleet's own resources
    pub namespace: String,
    /// Worker name used for label sharding, if any
    pub worker_name: Option<String>,
    /// Label selector derived from the worker name
    pub label_selector: Option<String>,
    /// Workers per controller
    pub worker_count: usize,
    /// Period of full resyncs
    pub resync_interval: Duration,
    /// Upper bound for the initial cache sync
    pub cache_sync_timeout: Duration,
    /// Upper bound for stopping runnables
    pub shutdown_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace: "kubermatic".to_string(),
            worker_name: None,
            label_selector: worker_label_selector(None),
            worker_count: 4,
            resync_interval: Duration::from_secs(300),
            cache_sync_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Label selector matching the objects a worker is responsible for.
///
/// A named worker handles objects labelled `worker-name=<name>`; the unnamed
/// worker handles objects without that label.
#[must_use]
pub fn worker_label_selector(worker_name: Option<&str>) -> Option<String> {
    match worker_name {
        Some(name) if !name.is_empty() => Some(format!("{}={}", crds::WORKER_NAME_LABEL, name)),
        _ => Some(format!("!{}", crds::WORKER_NAME_LABEL)),
    }
}

struct Running {
    token: CancellationToken,
    tasks: JoinSet<()>,
}

/// Hosts the controllers of one cluster.
pub struct ControllerManager {
    scope: ManagerScope,
    master: ClusterConnection,
    seed: Option<Seed>,
    seeds: Vec<ClusterConnection>,
    primary: ClusterProvider,
    providers: Vec<ClusterProvider>,
    runnables: BTreeMap<String, Box<dyn Runnable>>,
    registered: Vec<String>,
    last_errors: Arc<Mutex<BTreeMap<String, String>>>,
    settings: ControllerSettings,
    running: Option<Running>,
}

impl std::fmt::Debug for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerManager")
            .field("scope", &self.scope)
            .field("cluster", self.primary.name())
            .field("controllers", &self.registered)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl ControllerManager {
    /// Create a manager whose target cluster is `primary`
    #[must_use]
    pub fn new(
        scope: ManagerScope,
        master: ClusterConnection,
        primary: ClusterProvider,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            scope,
            master,
            seed: None,
            seeds: Vec::new(),
            primary,
            providers: Vec::new(),
            runnables: BTreeMap::new(),
            registered: Vec::new(),
            last_errors: Arc::new(Mutex::new(BTreeMap::new())),
            settings,
            running: None,
        }
    }

    /// Attach the seed this manager runs against
    #[must_use]
    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Attach the connections of every running seed (master scope)
    #[must_use]
    pub fn with_seed_connections(mut self, seeds: Vec<ClusterConnection>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Target scope
    #[must_use]
    pub fn scope(&self) -> &ManagerScope {
        &self.scope
    }

    /// Connection to the master cluster
    #[must_use]
    pub fn master(&self) -> &ClusterConnection {
        &self.master
    }

    /// Seed this manager runs against, if seed-scoped
    #[must_use]
    pub fn seed(&self) -> Option<&Seed> {
        self.seed.as_ref()
    }

    /// Connections of the running seeds, if master-scoped
    #[must_use]
    pub fn seed_connections(&self) -> &[ClusterConnection] {
        &self.seeds
    }

    /// Settings shared by the hosted controllers
    #[must_use]
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Provider of the target cluster
    #[must_use]
    pub fn primary(&self) -> &ClusterProvider {
        &self.primary
    }

    /// Provider of the target cluster, for registering caches
    pub fn primary_mut(&mut self) -> &mut ClusterProvider {
        &mut self.primary
    }

    /// Hand an extra provider to the manager. It is started and synced
    /// together with the primary one.
    pub fn add_cluster_provider(&mut self, provider: ClusterProvider) {
        debug!("Adding provider {} to manager of {}", provider.name(), self.primary.name());
        self.providers.push(provider);
    }

    /// Extra providers registered by controllers
    #[must_use]
    pub fn cluster_providers(&self) -> &[ClusterProvider] {
        &self.providers
    }

    /// Register a runnable under a unique name
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::DuplicateController`] if `name` is taken.
    pub fn add(&mut self, name: impl Into<String>, runnable: Box<dyn Runnable>) -> Result<(), ManagerError> {
        let name = name.into();
        if self.registered.contains(&name) {
            return Err(ManagerError::DuplicateController(name));
        }
        self.registered.push(name.clone());
        self.runnables.insert(name, runnable);
        Ok(())
    }

    /// Names of the registered controllers, in registration order
    #[must_use]
    pub fn controller_names(&self) -> &[String] {
        &self.registered
    }

    /// Last error returned by the named controller
    #[must_use]
    pub fn last_error(&self, name: &str) -> Option<String> {
        self.last_errors.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Whether the runnables have been spawned
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start informers, wait for every cache, then spawn the runnables.
    ///
    /// Everything runs on a child of `parent`; on failure the child is
    /// cancelled and the informers are joined before returning.
    ///
    /// # Errors
    ///
    /// * [`ManagerError::AlreadyStarted`] when called twice
    /// * [`ManagerError::Provider`] when a cache fails or does not sync within `sync_timeout`
    pub async fn start(&mut self, parent: &CancellationToken, sync_timeout: Duration) -> Result<(), ManagerError> {
        if self.running.is_some() {
            return Err(ManagerError::AlreadyStarted(self.primary.name().clone()));
        }
        let token = parent.child_token();

        if let Err(e) = self.start_and_sync(&token, sync_timeout).await {
            token.cancel();
            self.join_providers().await;
            return Err(e.into());
        }

        let mut tasks = JoinSet::new();
        let cluster = self.primary.name().clone();
        for (name, runnable) in std::mem::take(&mut self.runnables) {
            let token = token.clone();
            let cluster = cluster.clone();
            let errors = Arc::clone(&self.last_errors);
            tasks.spawn(async move {
                debug!("Starting controller {} on {}", name, cluster);
                match runnable.run(token).await {
                    Ok(()) => debug!("Controller {} on {} stopped", name, cluster),
                    Err(e) => {
                        error!(cluster = %cluster, controller = %name, error = %e, "Controller failed");
                        errors
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(name, e.to_string());
                    }
                }
            });
        }
        info!("Started {} controller(s) on {}", tasks.len(), cluster);
        self.running = Some(Running { token, tasks });
        Ok(())
    }

    async fn start_and_sync(&mut self, token: &CancellationToken, sync_timeout: Duration) -> Result<(), ProviderError> {
        self.primary.start_informers(token);
        for provider in &mut self.providers {
            provider.start_informers(token);
        }

        let mut waits: Vec<BoxFuture<'_, Result<(), ProviderError>>> =
            vec![Box::pin(self.primary.wait_for_caches_to_sync(token))];
        for provider in &self.providers {
            waits.push(Box::pin(provider.wait_for_caches_to_sync(token)));
        }
        match tokio::time::timeout(sync_timeout, futures::future::try_join_all(waits)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(ProviderError::SyncTimeout(self.primary.name().clone())),
        }
    }

    async fn join_providers(&mut self) {
        self.primary.join_informers().await;
        for provider in &mut self.providers {
            provider.join_informers().await;
        }
    }

    /// Cancel the runnables and informers and wait up to `timeout` for them.
    pub async fn stop(&mut self, timeout: Duration) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.token.cancel();

        let joined = tokio::time::timeout(timeout, async {
            while running.tasks.join_next().await.is_some() {}
            self.join_providers().await;
        })
        .await;
        if joined.is_err() {
            warn!("Controllers on {} did not stop within {:?}, aborting", self.primary.name(), timeout);
            running.tasks.abort_all();
            self.primary.abort_informers();
            for provider in &mut self.providers {
                provider.abort_informers();
            }
        }
        info!("Stopped controllers on {}", self.primary.name());
    }
}

impl Drop for ControllerManager {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.token.cancel();
        }
    }
}

/// Whether a factory installs into the master manager or into every seed's manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryScope {
    /// Installed into the master-scoped manager, rebuilt when the running seed set changes
    Master,
    /// Installed once per provisioned seed
    PerSeed,
}

/// Builds controllers into a [`ControllerManager`].
#[async_trait::async_trait]
pub trait ControllerFactory: Send + Sync {
    /// Where this factory installs
    fn scope(&self) -> FactoryScope;

    /// Register caches and runnables; returns the controller name.
    async fn install(&self, manager: &mut ControllerManager) -> Result<String, FactoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{Client, Config};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager() -> ControllerManager {
        let client = Client::try_from(Config::new("http://127.0.0.1:1".parse().unwrap())).unwrap();
        let master = ClusterConnection {
            name: ClusterName::master("master"),
            client: client.clone(),
        };
        let provider = ClusterProvider::from_client(ClusterName::seed("a"), client, Duration::from_secs(300), None);
        ControllerManager::new(ManagerScope::Seed("a".to_string()), master, provider, ControllerSettings::default())
    }

    fn idle() -> Box<dyn Runnable> {
        runnable_fn(|token: CancellationToken| async move {
            token.cancelled().await;
            Ok(())
        })
    }

    #[test]
    fn test_worker_label_selector() {
        assert_eq!(worker_label_selector(Some("blue")).as_deref(), Some("worker-name=blue"));
        assert_eq!(worker_label_selector(None).as_deref(), Some("!worker-name"));
        assert_eq!(worker_label_selector(Some("")).as_deref(), Some("!worker-name"));
    }

    #[tokio::test]
    async fn test_duplicate_controller_rejected() {
        let mut manager = manager();
        manager.add("rbac", idle()).unwrap();
        let err = manager.add("rbac", idle()).unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateController(name) if name == "rbac"));
        assert_eq!(manager.controller_names(), ["rbac".to_string()]);
    }

    #[tokio::test]
    async fn test_start_and_stop_runnables() {
        let mut manager = manager();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        manager
            .add(
                "watcher",
                runnable_fn(move |token: CancellationToken| async move {
                    token.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        manager
            .add(
                "broken",
                runnable_fn(|_token: CancellationToken| async move { Err::<(), BoxError>("boom".into()) }),
            )
            .unwrap();

        let root = CancellationToken::new();
        manager.start(&root, Duration::from_secs(1)).await.unwrap();
        assert!(manager.is_running());
        assert!(matches!(
            manager.start(&root, Duration::from_secs(1)).await,
            Err(ManagerError::AlreadyStarted(_))
        ));

        manager.stop(Duration::from_secs(5)).await;

        assert!(!manager.is_running());
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(manager.last_error("broken").as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_unsynced_cache_times_out() {
        let mut manager = manager();
        let _roles = manager.primary_mut().informer::<k8s_openapi::api::rbac::v1::ClusterRole>();
        manager.add("never-started", idle()).unwrap();

        let err = manager
            .start(&CancellationToken::new(), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::Provider(ProviderError::SyncTimeout(_))));
        assert!(!manager.is_running());
    }
}
