//! Seed synchronizer
//!
//! Per-seed controller: keeps the fleet namespace and a copy of the seed's
//! own `Seed` resource inside the seed, so components running there can read
//! their datacenter settings without access to the master.

use crate::rbac::resources::MANAGED_BY_LABEL;
use crds::Seed;
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use reconciling::{ManagedObject, NamedObject, ObjectModifier, ObjectReconciler, ObjectStore, ReconcileError, owner_labels};
use seed_lifecycle::{
    ClusterName, ControllerFactory, ControllerManager, FactoryError, FactoryScope, ReconcileMetrics, runnable_fn,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the controller inside its manager
pub const CONTROLLER_NAME: &str = "seed-synchronizer";

const MANAGED_BY: &str = "fleet-seed-sync";

/// Where the authoritative `Seed` comes from.
#[async_trait::async_trait]
pub trait SeedSource: Send + Sync {
    /// The current `Seed`, `None` if the source does not hold it
    async fn current(&self) -> Result<Option<Seed>, kube::Error>;
}

/// Reads the `Seed` resource from the master.
pub struct MasterSeedSource {
    api: Api<Seed>,
    name: String,
}

impl MasterSeedSource {
    /// Source for seed `name` in the master `namespace`
    pub fn new(client: kube::Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl SeedSource for MasterSeedSource {
    async fn current(&self) -> Result<Option<Seed>, kube::Error> {
        self.api.get_opt(&self.name).await
    }
}

fn desired(namespace: &str, seed: &Seed) -> (Vec<ManagedObject>, Vec<ObjectModifier>) {
    let spec = seed.spec.clone();
    let objects = vec![
        ManagedObject::Namespace(NamedObject::new(namespace, |namespace: Namespace| Ok(namespace))),
        ManagedObject::Seed(NamedObject::new(seed.seed_name(), move |mut copy: Seed| {
            copy.spec = spec.clone();
            Ok(copy)
        })),
    ];
    let labels = owner_labels(BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]));
    (objects, vec![labels])
}

/// Mirrors one seed's `Seed` resource into the seed itself.
pub struct SeedSync<S> {
    cluster: ClusterName,
    namespace: String,
    installed: Seed,
    source: Arc<dyn SeedSource>,
    reconciler: ObjectReconciler<S>,
    metrics: Arc<ReconcileMetrics>,
    resync_interval: Duration,
}

impl<S> fmt::Debug for SeedSync<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedSync")
            .field("cluster", &self.cluster)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl<S> SeedSync<S>
where
    S: ObjectStore + Send + Sync + 'static,
{
    /// Synchronizer writing into `namespace` of the seed behind `reconciler`.
    ///
    /// `installed` is the `Seed` the seed's controllers were built from; it
    /// is copied whenever `source` does not hold the resource.
    pub fn new(
        cluster: ClusterName,
        namespace: impl Into<String>,
        installed: Seed,
        source: Arc<dyn SeedSource>,
        reconciler: ObjectReconciler<S>,
        metrics: Arc<ReconcileMetrics>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            installed,
            source,
            reconciler,
            metrics,
            resync_interval,
        }
    }

    async fn sync(&self) -> Result<(), ReconcileError> {
        let seed = match self.source.current().await {
            Ok(Some(seed)) => seed,
            // Seeds from a datacenters file have no resource in the master
            Ok(None) => self.installed.clone(),
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "Failed to read Seed from the master, retrying next round");
                return Ok(());
            }
        };
        let (objects, modifiers) = desired(&self.namespace, &seed);
        let report = self
            .reconciler
            .reconcile_objects(Some(&self.namespace), &objects, &modifiers)
            .await;
        self.metrics.record(&self.cluster.to_string(), &report);
        report.into_result()
    }

    /// Sync every `resync_interval` until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        let mut resync = tokio::time::interval(self.resync_interval);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = resync.tick() => {}
            }
            match self.sync().await {
                Ok(()) => debug!("Synced Seed into {}", self.cluster),
                Err(e) => warn!(cluster = %self.cluster, error = %e, "Failed to sync Seed"),
            }
        }
        info!("Seed synchronizer on {} stopped", self.cluster);
    }
}

/// Installs the synchronizer into every seed's manager.
#[derive(Debug, Clone)]
pub struct SeedSyncFactory {
    metrics: Arc<ReconcileMetrics>,
}

impl SeedSyncFactory {
    /// Factory recording outcomes into `metrics`
    pub fn new(metrics: Arc<ReconcileMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait::async_trait]
impl ControllerFactory for SeedSyncFactory {
    fn scope(&self) -> FactoryScope {
        FactoryScope::PerSeed
    }

    async fn install(&self, manager: &mut ControllerManager) -> Result<String, FactoryError> {
        let seed = manager
            .seed()
            .cloned()
            .ok_or_else(|| FactoryError::Install(format!("{CONTROLLER_NAME} needs a seed manager")))?;
        let settings = manager.settings().clone();
        let source = MasterSeedSource::new(manager.master().client.clone(), &settings.namespace, seed.seed_name());
        let primary = manager.primary();
        let sync = SeedSync::new(
            primary.name().clone(),
            settings.namespace.clone(),
            seed,
            Arc::new(source),
            ObjectReconciler::new(primary.object_store()),
            Arc::clone(&self.metrics),
            settings.resync_interval,
        );
        manager.add(
            CONTROLLER_NAME,
            runnable_fn(move |token: CancellationToken| async move {
                sync.run(token).await;
                Ok(())
            }),
        )?;
        Ok(CONTROLLER_NAME.to_string())
    }
}
