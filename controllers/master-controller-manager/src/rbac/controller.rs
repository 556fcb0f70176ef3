//! Work queue driven RBAC propagation.
//!
//! Keys are (cluster, project). Every key is reconciled by exactly one worker
//! at a time; failures are requeued with per-key backoff.

use super::resources::{project_labels, project_objects};
use crds::Project;
use kube::ResourceExt;
use kube_runtime::reflector::{ObjectRef, Store};
use reconciling::{ObjectReconciler, ObjectStore, ReconcileError};
use seed_lifecycle::{ClusterName, ReconcileMetrics, WorkQueue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unit of work: one project in one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RbacKey {
    /// Target cluster
    pub cluster: ClusterName,
    /// Project name
    pub project: String,
}

impl fmt::Display for RbacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/project/{}", self.cluster, self.project)
    }
}

/// Ensure the RBAC objects of `project` in one cluster.
///
/// # Errors
///
/// Returns [`ReconcileError::Batch`] if any object failed; the others were
/// still reconciled.
pub async fn ensure_project_rbac<S: ObjectStore>(
    reconciler: &ObjectReconciler<S>,
    cluster: &ClusterName,
    project: &Project,
    metrics: &ReconcileMetrics,
) -> Result<(), ReconcileError> {
    let name = project.name_any();
    let report = reconciler
        .reconcile_objects(None, &project_objects(project), &[project_labels(&name)])
        .await;
    metrics.record(&cluster.to_string(), &report);
    report.into_result()
}

/// Propagates project RBAC to the master and every running seed.
pub struct RbacController<S> {
    projects: Store<Project>,
    clusters: BTreeMap<ClusterName, ObjectReconciler<S>>,
    queue: WorkQueue<RbacKey>,
    metrics: Arc<ReconcileMetrics>,
    worker_count: usize,
    resync_interval: Duration,
}

impl<S> fmt::Debug for RbacController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RbacController")
            .field("clusters", &self.clusters.keys().collect::<Vec<_>>())
            .field("worker_count", &self.worker_count)
            .finish_non_exhaustive()
    }
}

impl<S> RbacController<S>
where
    S: ObjectStore + Send + Sync + 'static,
{
    /// Create a controller over `clusters`, fed by `queue`
    pub fn new(
        projects: Store<Project>,
        clusters: BTreeMap<ClusterName, ObjectReconciler<S>>,
        queue: WorkQueue<RbacKey>,
        metrics: Arc<ReconcileMetrics>,
        worker_count: usize,
        resync_interval: Duration,
    ) -> Self {
        Self {
            projects,
            clusters,
            queue,
            metrics,
            worker_count: worker_count.max(1),
            resync_interval,
        }
    }

    /// Queue every cached project for every cluster
    pub fn enqueue_all(&self) {
        let projects = self.projects.state();
        for project in &projects {
            for cluster in self.clusters.keys() {
                self.queue.add(RbacKey {
                    cluster: cluster.clone(),
                    project: project.name_any(),
                });
            }
        }
        debug!("Queued {} project(s) for {} cluster(s)", projects.len(), self.clusters.len());
    }

    async fn sync(&self, key: &RbacKey) -> Result<(), ReconcileError> {
        let Some(project) = self.projects.get(&ObjectRef::new(&key.project)) else {
            debug!("Project {} no longer exists, nothing to ensure", key.project);
            return Ok(());
        };
        let Some(reconciler) = self.clusters.get(&key.cluster) else {
            return Ok(());
        };
        ensure_project_rbac(reconciler, &key.cluster, &project, &self.metrics).await
    }

    async fn worker(self: Arc<Self>) {
        while let Some(key) = self.queue.get().await {
            self.metrics.rbac_workers.inc();
            let result = self.sync(&key).await;
            self.metrics.rbac_workers.dec();
            self.queue.done(&key);
            match result {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    warn!(
                        cluster = %key.cluster,
                        project = %key.project,
                        error = %e,
                        requeues = self.queue.num_requeues(&key),
                        "Failed to reconcile project RBAC, requeueing"
                    );
                    self.queue.add_rate_limited(key);
                }
            }
        }
    }

    /// Run the workers and the periodic resync until `token` is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut workers = JoinSet::new();
        for _ in 0..self.worker_count {
            workers.spawn(Arc::clone(&self).worker());
        }
        info!(
            "RBAC controller running with {} worker(s) on {} cluster(s)",
            self.worker_count,
            self.clusters.len()
        );

        self.enqueue_all();
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.resync_interval) => self.enqueue_all(),
            }
        }

        self.queue.shut_down();
        while workers.join_next().await.is_some() {}
        info!("RBAC controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::resources::role_name;
    use crds::{ProjectGroup, ProjectSpec};
    use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
    use kube_runtime::reflector;
    use kube_runtime::watcher;
    use reconciling::MockObjectStore;

    fn project(name: &str, owners: &[&str]) -> Project {
        Project::new(
            name,
            ProjectSpec {
                name: name.to_string(),
                owners: owners.iter().map(|o| (*o).to_string()).collect(),
                ..Default::default()
            },
        )
    }

    fn projects(items: Vec<Project>) -> Store<Project> {
        let (reader, mut writer) = reflector::store::<Project>();
        for item in items {
            writer.apply_watcher_event(&watcher::Event::Apply(item));
        }
        reader
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ensure_project_rbac_records_outcomes() {
        let store = MockObjectStore::new();
        let reconciler = ObjectReconciler::new(store.clone());
        let metrics = ReconcileMetrics::new();
        let cluster = ClusterName::seed("europe-west");

        ensure_project_rbac(&reconciler, &cluster, &project("payments", &["alice"]), &metrics)
            .await
            .unwrap();

        assert_eq!(store.names::<ClusterRole>().len(), 3);
        assert_eq!(store.names::<ClusterRoleBinding>().len(), 3);
        let created = metrics
            .outcomes
            .with_label_values(&["seed/europe-west", "ClusterRole", "created"])
            .get();
        assert_eq!(created, 3);
    }

    #[tokio::test]
    async fn test_projects_fan_out_to_every_cluster_and_failures_stay_local() {
        let master = MockObjectStore::new();
        let seed = MockObjectStore::new();
        seed.inject_error(&role_name("billing", ProjectGroup::Viewers), "admission webhook denied");

        let clusters = BTreeMap::from([
            (ClusterName::master("master"), ObjectReconciler::new(master.clone())),
            (ClusterName::seed("a"), ObjectReconciler::new(seed.clone())),
        ]);
        let metrics = Arc::new(ReconcileMetrics::new());
        let controller = Arc::new(RbacController::new(
            projects(vec![project("payments", &["alice"]), project("billing", &["bob"])]),
            clusters,
            WorkQueue::with_backoff(Duration::from_millis(5), Duration::from_millis(50)),
            Arc::clone(&metrics),
            2,
            Duration::from_secs(300),
        ));

        let token = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&controller).run(token.clone()));

        wait_for(|| master.names::<ClusterRoleBinding>().len() == 6).await;
        // The injected failure hits the role and the binding of the same name
        wait_for(|| seed.names::<ClusterRoleBinding>().len() == 5).await;
        wait_for(|| {
            metrics
                .outcomes
                .with_label_values(&["seed/a", "ClusterRole", "failed"])
                .get()
                >= 2
        })
        .await;

        assert_eq!(master.names::<ClusterRole>().len(), 6);
        assert_eq!(seed.names::<ClusterRole>().len(), 5);
        assert!(
            !seed
                .names::<ClusterRole>()
                .contains(&role_name("billing", ProjectGroup::Viewers))
        );
        assert_eq!(
            metrics
                .outcomes
                .with_label_values(&["master/master", "ClusterRole", "failed"])
                .get(),
            0
        );

        token.cancel();
        run.await.unwrap();
        assert_eq!(metrics.rbac_workers.get(), 0);
    }

    #[tokio::test]
    async fn test_deleted_project_is_a_no_op() {
        let store = MockObjectStore::new();
        let controller = RbacController::new(
            projects(vec![]),
            BTreeMap::from([(ClusterName::master("master"), ObjectReconciler::new(store.clone()))]),
            WorkQueue::new(),
            Arc::new(ReconcileMetrics::new()),
            1,
            Duration::from_secs(300),
        );

        let key = RbacKey {
            cluster: ClusterName::master("master"),
            project: "gone".to_string(),
        };
        controller.sync(&key).await.unwrap();
        assert_eq!(store.writes(), 0);
        assert_eq!(key.to_string(), "master/master/project/gone");
    }
}
