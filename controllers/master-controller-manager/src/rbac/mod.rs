//! RBAC fan-out controller
//!
//! Keeps the ClusterRoles and ClusterRoleBindings of every `Project`
//! identical on the master and on every running seed. Installed into the
//! master-scoped manager, so it is rebuilt whenever the running seed set
//! changes.

pub mod controller;
pub mod resources;

use controller::{RbacController, RbacKey};
use crds::Project;
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::ResourceExt;
use reconciling::ObjectReconciler;
use resources::{PROJECT_LABEL, managed_by_selector};
use seed_lifecycle::{
    ClusterName, ClusterProvider, ControllerFactory, ControllerManager, FactoryError, FactoryScope, ReconcileMetrics,
    WorkQueue, runnable_fn, sync_each,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Name of the controller inside its manager
pub const CONTROLLER_NAME: &str = "rbac-controller";

/// Enqueue drifted roles of `provider`'s cluster by their project label
fn watch_roles(provider: &mut ClusterProvider, queue: &WorkQueue<RbacKey>) {
    let _roles = provider.informer_with_labels::<ClusterRole>(&managed_by_selector());
    let cluster = provider.name().clone();
    let queue = queue.clone();
    provider.on_event::<ClusterRole>(Arc::new(move |role: &ClusterRole| {
        if let Some(project) = role.labels().get(PROJECT_LABEL) {
            queue.add(RbacKey {
                cluster: cluster.clone(),
                project: project.clone(),
            });
        }
    }));
}

/// Installs the RBAC controller into the master-scoped manager.
#[derive(Debug, Clone)]
pub struct RbacControllerFactory {
    metrics: Arc<ReconcileMetrics>,
}

impl RbacControllerFactory {
    /// Factory recording outcomes into `metrics`
    pub fn new(metrics: Arc<ReconcileMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait::async_trait]
impl ControllerFactory for RbacControllerFactory {
    fn scope(&self) -> FactoryScope {
        FactoryScope::Master
    }

    async fn install(&self, manager: &mut ControllerManager) -> Result<String, FactoryError> {
        let settings = manager.settings().clone();
        let seeds = manager.seed_connections().to_vec();
        let queue = WorkQueue::new();

        let master = manager.primary().name().clone();
        let targets: Arc<Vec<ClusterName>> = Arc::new(
            std::iter::once(master.clone())
                .chain(seeds.iter().map(|seed| seed.name.clone()))
                .collect(),
        );

        let mut clusters = BTreeMap::new();
        let primary = manager.primary_mut();
        let projects = primary.filtered_informer::<Project>();
        {
            let queue = queue.clone();
            let targets = Arc::clone(&targets);
            primary.on_event::<Project>(Arc::new(move |project: &Project| {
                let name = project.name_any();
                for cluster in targets.iter() {
                    queue.add(RbacKey {
                        cluster: cluster.clone(),
                        project: name.clone(),
                    });
                }
            }));
        }
        watch_roles(primary, &queue);
        clusters.insert(master, ObjectReconciler::new(primary.object_store()));

        // Seed caches sync inside the runnable, each on its own, so a seed that
        // stopped answering is left out instead of failing the master manager
        let seed_providers: Vec<ClusterProvider> = seeds
            .into_iter()
            .map(|seed| {
                let mut provider = ClusterProvider::from_client(seed.name, seed.client, settings.resync_interval, None);
                watch_roles(&mut provider, &queue);
                provider
            })
            .collect();

        info!("Installing {} for {} cluster(s)", CONTROLLER_NAME, targets.len());
        let metrics = Arc::clone(&self.metrics);
        manager.add(
            CONTROLLER_NAME,
            runnable_fn(move |token: CancellationToken| async move {
                let mut clusters = clusters;
                let mut seeds = sync_each(seed_providers, &token, settings.cache_sync_timeout).await;
                for provider in &seeds {
                    clusters.insert(provider.name().clone(), ObjectReconciler::new(provider.object_store()));
                }
                let controller = Arc::new(RbacController::new(
                    projects,
                    clusters,
                    queue,
                    metrics,
                    settings.worker_count,
                    settings.resync_interval,
                ));
                controller.run(token).await;
                for provider in &mut seeds {
                    provider.join_informers().await;
                }
                Ok(())
            }),
        )?;
        Ok(CONTROLLER_NAME.to_string())
    }
}
