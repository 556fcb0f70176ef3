//! Per-cluster client and cache context
//!
//! A `ClusterProvider` owns the client for one cluster (the master or a seed)
//! and the set of watch caches registered against it. Controllers obtain
//! read-only [`Store`]s from the provider while they are being installed; the
//! caches only fill once [`ClusterProvider::start_informers`] ran and are only
//! handed to running controllers after [`ClusterProvider::wait_for_caches_to_sync`]
//! returned.

use crate::error::ProviderError;
use futures::future::{self, BoxFuture, FutureExt};
use futures::StreamExt;
use kube::api::Api;
use kube::{Client, Config, Resource};
use kube_runtime::reflector::{self, Store};
use kube_runtime::{WatchStreamExt, watcher};
use reconciling::KubeObjectStore;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which side of the fleet a cluster is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterKind {
    /// The central cluster running the master controller manager
    Master,
    /// A managed remote cluster
    Seed,
}

/// Cluster identity, rendered as `master/<name>` or `seed/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterName {
    kind: ClusterKind,
    name: String,
}

impl ClusterName {
    /// Identity of the master cluster
    pub fn master(name: impl Into<String>) -> Self {
        Self {
            kind: ClusterKind::Master,
            name: name.into(),
        }
    }

    /// Identity of a seed cluster
    pub fn seed(name: impl Into<String>) -> Self {
        Self {
            kind: ClusterKind::Seed,
            name: name.into(),
        }
    }

    /// Master or seed
    #[must_use]
    pub fn kind(&self) -> ClusterKind {
        self.kind
    }

    /// Bare cluster name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ClusterKind::Master => write!(f, "master/{}", self.name),
            ClusterKind::Seed => write!(f, "seed/{}", self.name),
        }
    }
}

/// Client handle of one cluster, without any caches.
#[derive(Clone)]
pub struct ClusterConnection {
    /// Cluster identity
    pub name: ClusterName,
    /// Client for the cluster's API server
    pub client: Client,
}

impl fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnection").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Callback invoked for every object a watch cache sees change.
pub type EventHandler<K> = Arc<dyn Fn(&K) + Send + Sync>;

type HandlerList<K> = Arc<Mutex<Vec<EventHandler<K>>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InformerKey {
    kind: TypeId,
    namespace: Option<String>,
    selector: Option<String>,
}

struct InformerEntry {
    kind: String,
    reader: Box<dyn Any + Send + Sync>,
    task: Mutex<Option<BoxFuture<'static, ()>>>,
    ready: Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>,
}

/// Client plus watch caches for one cluster.
pub struct ClusterProvider {
    name: ClusterName,
    client: Client,
    resync_interval: Duration,
    label_selector: Option<String>,
    informers: HashMap<InformerKey, InformerEntry>,
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    tasks: JoinSet<()>,
    synced: AtomicBool,
}

impl fmt::Debug for ClusterProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterProvider")
            .field("name", &self.name)
            .field("resync_interval", &self.resync_interval)
            .field("label_selector", &self.label_selector)
            .field("informers", &self.informers.len())
            .finish_non_exhaustive()
    }
}

impl ClusterProvider {
    /// Build a provider from a client config.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Client`] if the client cannot be built.
    pub fn new(
        name: ClusterName,
        config: Config,
        resync_interval: Duration,
        label_selector: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::try_from(config).map_err(|source| ProviderError::Client {
            cluster: name.clone(),
            source,
        })?;
        Ok(Self::from_client(name, client, resync_interval, label_selector))
    }

    /// Build a provider on an existing client
    #[must_use]
    pub fn from_client(
        name: ClusterName,
        client: Client,
        resync_interval: Duration,
        label_selector: Option<String>,
    ) -> Self {
        Self {
            name,
            client,
            resync_interval,
            label_selector,
            informers: HashMap::new(),
            handlers: HashMap::new(),
            tasks: JoinSet::new(),
            synced: AtomicBool::new(false),
        }
    }

    /// Cluster identity
    #[must_use]
    pub fn name(&self) -> &ClusterName {
        &self.name
    }

    /// Client of this cluster
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Connection handle (client without caches)
    #[must_use]
    pub fn connection(&self) -> ClusterConnection {
        ClusterConnection {
            name: self.name.clone(),
            client: self.client.clone(),
        }
    }

    /// Store for writes and strongly consistent reads
    #[must_use]
    pub fn object_store(&self) -> KubeObjectStore {
        KubeObjectStore::new(self.client.clone())
    }

    /// Interval for periodic full resyncs of the controllers using this provider
    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        self.resync_interval
    }

    /// Label selector applied by [`ClusterProvider::filtered_informer`]
    #[must_use]
    pub fn label_selector(&self) -> Option<&str> {
        self.label_selector.as_deref()
    }

    /// Whether every registered cache finished its initial list
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Number of registered caches
    #[must_use]
    pub fn informer_count(&self) -> usize {
        self.informers.len()
    }

    /// Cache of every `K` in the cluster.
    ///
    /// Registering the same kind twice returns the existing cache.
    pub fn informer<K>(&mut self) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let api = Api::<K>::all(self.client.clone());
        self.register(api, None, None)
    }

    /// Cache of every `K` matching the provider's label selector
    pub fn filtered_informer<K>(&mut self) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let api = Api::<K>::all(self.client.clone());
        let selector = self.label_selector.clone();
        self.register(api, None, selector)
    }

    /// Cache of every `K` matching `selector`
    pub fn informer_with_labels<K>(&mut self, selector: &str) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let api = Api::<K>::all(self.client.clone());
        self.register(api, None, Some(selector.to_string()))
    }

    /// Cache of the `K`s in one namespace matching the provider's label selector
    pub fn namespaced_informer<K>(&mut self, namespace: &str) -> Store<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + fmt::Debug
            + Send
            + Sync
            + 'static,
    {
        let api = Api::<K>::namespaced(self.client.clone(), namespace);
        let selector = self.label_selector.clone();
        self.register(api, Some(namespace.to_string()), selector)
    }

    /// Call `handler` for every `K` any cache of this provider sees applied or deleted.
    pub fn on_event<K>(&mut self, handler: EventHandler<K>)
    where
        K: Resource<DynamicType = ()> + Send + Sync + 'static,
    {
        let handlers = self.handlers_for::<K>();
        handlers.lock().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    fn handlers_for<K>(&mut self) -> HandlerList<K>
    where
        K: Resource<DynamicType = ()> + Send + Sync + 'static,
    {
        let entry = self
            .handlers
            .entry(TypeId::of::<K>())
            .or_insert_with(|| Box::new(HandlerList::<K>::default()));
        match entry.downcast_ref::<HandlerList<K>>() {
            Some(list) => Arc::clone(list),
            None => HandlerList::<K>::default(),
        }
    }

    fn register<K>(&mut self, api: Api<K>, namespace: Option<String>, selector: Option<String>) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let key = InformerKey {
            kind: TypeId::of::<K>(),
            namespace,
            selector: selector.clone(),
        };
        if let Some(existing) = self.informers.get(&key).and_then(|e| e.reader.downcast_ref::<Store<K>>()) {
            return existing.clone();
        }

        let kind = K::kind(&()).into_owned();
        debug!("Registering {} informer on {} (selector: {:?})", kind, self.name, selector);

        let (reader, writer) = reflector::store::<K>();
        let mut config = watcher::Config::default();
        if let Some(selector) = &selector {
            config = config.labels(selector);
        }

        let handlers = self.handlers_for::<K>();
        let cluster = self.name.clone();
        let watched = kind.clone();
        let stream = reflector::reflector(writer, watcher(api, config)).default_backoff().touched_objects();
        let task = async move {
            stream
                .for_each(move |event| {
                    match event {
                        Ok(object) => {
                            let current = handlers.lock().unwrap_or_else(PoisonError::into_inner).clone();
                            for handler in &current {
                                handler(&object);
                            }
                        }
                        Err(e) => warn!(cluster = %cluster, kind = %watched, error = %e, "Watch error"),
                    }
                    future::ready(())
                })
                .await;
        }
        .boxed();

        let ready_reader = reader.clone();
        let ready = Box::new(move || {
            let reader = ready_reader.clone();
            async move { reader.wait_until_ready().await.is_ok() }.boxed()
        });

        self.informers.insert(
            key,
            InformerEntry {
                kind,
                reader: Box::new(reader.clone()),
                task: Mutex::new(Some(task)),
                ready,
            },
        );
        self.synced.store(false, Ordering::Release);
        reader
    }

    /// Start every registered informer that is not running yet.
    ///
    /// The reflector tasks stop when `token` is cancelled.
    pub fn start_informers(&mut self, token: &CancellationToken) {
        let mut started = 0usize;
        for entry in self.informers.values_mut() {
            if let Some(task) = entry.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
                let token = token.clone();
                self.tasks.spawn(async move {
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = task => {}
                    }
                });
                started += 1;
            }
        }
        if started > 0 {
            info!("Started {} informer(s) on {}", started, self.name);
        }
    }

    /// Wait until every registered cache finished its initial list.
    ///
    /// # Errors
    ///
    /// * [`ProviderError::SyncCancelled`] if `token` fires first
    /// * [`ProviderError::CacheClosed`] if a reflector stopped before its cache was ready
    pub async fn wait_for_caches_to_sync(&self, token: &CancellationToken) -> Result<(), ProviderError> {
        let waits = self.informers.values().map(|entry| {
            let kind = entry.kind.clone();
            let ready = (entry.ready)();
            async move { if ready.await { Ok(()) } else { Err(kind) } }
        });

        tokio::select! {
            () = token.cancelled() => Err(ProviderError::SyncCancelled(self.name.clone())),
            result = future::try_join_all(waits) => match result {
                Ok(_) => {
                    self.synced.store(true, Ordering::Release);
                    debug!("Caches of {} synced", self.name);
                    Ok(())
                }
                Err(kind) => Err(ProviderError::CacheClosed {
                    cluster: self.name.clone(),
                    kind,
                }),
            },
        }
    }

    /// Wait for the informer tasks to finish after their token was cancelled.
    pub async fn join_informers(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    /// Abort informer tasks that did not stop in time.
    pub fn abort_informers(&mut self) {
        self.tasks.abort_all();
    }
}

/// Start and sync every provider on its own.
///
/// Returns the providers whose caches synced within `timeout`. The others
/// are logged, their informers aborted, and they are dropped, so one
/// unreachable cluster cannot hold back the rest.
pub async fn sync_each(
    mut providers: Vec<ClusterProvider>,
    token: &CancellationToken,
    timeout: Duration,
) -> Vec<ClusterProvider> {
    for provider in &mut providers {
        provider.start_informers(token);
    }
    let results = future::join_all(providers.iter().map(|provider| async move {
        match tokio::time::timeout(timeout, provider.wait_for_caches_to_sync(token)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::SyncTimeout(provider.name().clone())),
        }
    }))
    .await;

    let mut synced = Vec::with_capacity(providers.len());
    for (mut provider, result) in providers.into_iter().zip(results) {
        match result {
            Ok(()) => synced.push(provider),
            Err(e) => {
                warn!(cluster = %provider.name(), error = %e, "Caches did not sync, leaving cluster out");
                provider.abort_informers();
            }
        }
    }
    synced
}
