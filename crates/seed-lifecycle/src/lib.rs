//! Seed fleet lifecycle
//!
//! Builds an isolated client and cache context per cluster, discovers the
//! seed set, and starts, stops and restarts controllers as seeds come, go
//! or change. Also hosts the leader election gate and the work queue the
//! controllers share.
//!
//! # Modules
//!
//! - [`provider`]: per-cluster client and watch caches
//! - [`registry`]: seed discovery and kubeconfig resolution
//! - [`manager`]: controller manager and factory trait
//! - [`lifecycle`]: the seed lifecycle loop
//! - [`leader_election`]: Lease based leader election
//! - [`workqueue`]: deduplicating work queue
//! - [`metrics`]: Prometheus metrics

pub mod error;
pub mod leader_election;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod provider;
pub mod registry;
pub mod workqueue;

pub use error::{FactoryError, LeaderElectionError, LifecycleError, ManagerError, ProviderError, RegistryError};
pub use leader_election::{
    ElectionOutcome, KubeLeaseLock, LeaderElectionConfig, LeaseLock, election_name, holder_identity, run_as_leader,
};
pub use lifecycle::{
    KubeSeedStatusReporter, SeedLifecycleManager, SeedState, SeedStatusReporter, fleet_namespace_selector, spawn_seed_watch,
};
pub use manager::{
    BoxError, ControllerFactory, ControllerManager, ControllerSettings, FactoryScope, ManagerScope, Runnable,
    runnable_fn, worker_label_selector,
};
pub use metrics::{ReconcileMetrics, SeedKubeconfigHealth, SeedLifecycleMetrics};
pub use provider::{ClusterConnection, ClusterKind, ClusterName, ClusterProvider, EventHandler, sync_each};
pub use registry::{
    CrdSeedsGetter, DatacentersFileSeedsGetter, KubeconfigFileGetter, Resolution, SecretKubeconfigGetter,
    SeedClientConfig, SeedKubeconfigGetter, SeedRegistry, SeedsGetter,
};
pub use workqueue::WorkQueue;
