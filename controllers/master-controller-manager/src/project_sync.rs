//! Project namespace synchronizer
//!
//! Per-seed controller: every `Project` of the master gets a `project-<name>`
//! Namespace in the seed, labelled with the project it belongs to.

use crate::rbac::resources::{MANAGED_BY_LABEL, PROJECT_LABEL};
use crds::Project;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use kube_runtime::reflector::{ObjectRef, Store};
use reconciling::{
    ManagedObject, NamedObject, ObjectModifier, ObjectReconciler, ObjectStore, ReconcileError, owner_labels,
};
use seed_lifecycle::{
    ClusterName, ClusterProvider, ControllerFactory, ControllerManager, FactoryError, FactoryScope, ReconcileMetrics,
    WorkQueue, runnable_fn,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the controller inside its manager
pub const CONTROLLER_NAME: &str = "project-namespace-synchronizer";

const MANAGED_BY: &str = "fleet-project-sync";

/// `project-<project>`
#[must_use]
pub fn namespace_name(project: &str) -> String {
    format!("project-{project}")
}

fn desired(project: &str) -> (Vec<ManagedObject>, Vec<ObjectModifier>) {
    let objects = vec![ManagedObject::Namespace(NamedObject::new(
        namespace_name(project),
        |namespace: Namespace| Ok(namespace),
    ))];
    let labels = owner_labels(BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (PROJECT_LABEL.to_string(), project.to_string()),
    ]));
    (objects, vec![labels])
}

/// Keeps project namespaces of one seed in line with the master's projects.
pub struct ProjectNamespaceSync<S> {
    cluster: ClusterName,
    projects: Store<Project>,
    reconciler: ObjectReconciler<S>,
    queue: WorkQueue<String>,
    metrics: Arc<ReconcileMetrics>,
    resync_interval: Duration,
}

impl<S> fmt::Debug for ProjectNamespaceSync<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectNamespaceSync")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

impl<S> ProjectNamespaceSync<S>
where
    S: ObjectStore + Send + Sync + 'static,
{
    /// Synchronizer for `cluster`, reading projects from `projects`
    pub fn new(
        cluster: ClusterName,
        projects: Store<Project>,
        reconciler: ObjectReconciler<S>,
        queue: WorkQueue<String>,
        metrics: Arc<ReconcileMetrics>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            projects,
            reconciler,
            queue,
            metrics,
            resync_interval,
        }
    }

    async fn sync(&self, project: &str) -> Result<(), ReconcileError> {
        if self.projects.get(&ObjectRef::new(project)).is_none() {
            debug!("Project {} no longer exists, nothing to ensure", project);
            return Ok(());
        }
        let (objects, modifiers) = desired(project);
        let report = self.reconciler.reconcile_objects(None, &objects, &modifiers).await;
        self.metrics.record(&self.cluster.to_string(), &report);
        report.into_result()
    }

    fn enqueue_all(&self) {
        for project in self.projects.state() {
            self.queue.add(project.name_any());
        }
    }

    /// Process the queue until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        self.enqueue_all();
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.reset();
        loop {
            let project = tokio::select! {
                () = token.cancelled() => break,
                _ = resync.tick() => {
                    self.enqueue_all();
                    continue;
                }
                next = self.queue.get() => match next {
                    Some(project) => project,
                    None => break,
                },
            };
            let result = self.sync(&project).await;
            self.queue.done(&project);
            match result {
                Ok(()) => self.queue.forget(&project),
                Err(e) => {
                    warn!(cluster = %self.cluster, project = %project, error = %e, "Failed to sync project namespace");
                    self.queue.add_rate_limited(project);
                }
            }
        }
        self.queue.shut_down();
        info!("Project namespace synchronizer on {} stopped", self.cluster);
    }
}

/// Installs the synchronizer into every seed's manager.
#[derive(Debug, Clone)]
pub struct ProjectNamespaceFactory {
    metrics: Arc<ReconcileMetrics>,
}

impl ProjectNamespaceFactory {
    /// Factory recording outcomes into `metrics`
    pub fn new(metrics: Arc<ReconcileMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait::async_trait]
impl ControllerFactory for ProjectNamespaceFactory {
    fn scope(&self) -> FactoryScope {
        FactoryScope::PerSeed
    }

    async fn install(&self, manager: &mut ControllerManager) -> Result<String, FactoryError> {
        let settings = manager.settings().clone();
        let master = manager.master().clone();
        let queue = WorkQueue::new();

        // Projects live in the master; this seed's manager gets its own cache of them
        let mut master_provider = ClusterProvider::from_client(
            master.name,
            master.client,
            settings.resync_interval,
            settings.label_selector.clone(),
        );
        let projects = master_provider.filtered_informer::<Project>();
        {
            let queue = queue.clone();
            master_provider.on_event::<Project>(Arc::new(move |project: &Project| queue.add(project.name_any())));
        }
        manager.add_cluster_provider(master_provider);

        let seed = manager.primary();
        let sync = ProjectNamespaceSync::new(
            seed.name().clone(),
            projects,
            ObjectReconciler::new(seed.object_store()),
            queue,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crds::ProjectSpec;
    use kube_runtime::{reflector, watcher};
    use reconciling::MockObjectStore;

    fn projects(names: &[&str]) -> Store<Project> {
        let (reader, mut writer) = reflector::store::<Project>();
        for name in names {
            writer.apply_watcher_event(&watcher::Event::Apply(Project::new(name, ProjectSpec::default())));
        }
        reader
    }

    #[tokio::test]
    async fn test_every_project_gets_a_labelled_namespace() {
        let store = MockObjectStore::new();
        let queue = WorkQueue::new();
        let sync = ProjectNamespaceSync::new(
            ClusterName::seed("a"),
            projects(&["payments", "billing"]),
            ObjectReconciler::new(store.clone()),
            queue,
            Arc::new(ReconcileMetrics::new()),
            Duration::from_secs(300),
        );

        let token = CancellationToken::new();
        let run = tokio::spawn(sync.run(token.clone()));
        for _ in 0..500 {
            if store.names::<Namespace>().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        run.await.unwrap();

        assert_eq!(store.names::<Namespace>(), ["project-billing", "project-payments"]);
        let namespace: Namespace = store.object(None, "project-payments").unwrap();
        assert_eq!(
            namespace.labels().get(PROJECT_LABEL).map(String::as_str),
            Some("payments")
        );
    }

    #[tokio::test]
    async fn test_deleted_project_is_skipped() {
        let store = MockObjectStore::new();
        let sync = ProjectNamespaceSync::new(
            ClusterName::seed("a"),
            projects(&[]),
            ObjectReconciler::new(store.clone()),
            WorkQueue::new(),
            Arc::new(ReconcileMetrics::new()),
            Duration::from_secs(300),
        );

        sync.sync("gone").await.unwrap();
        assert_eq!(store.writes(), 0);
    }
}
