//! Error types of the seed lifecycle machinery.

use crate::provider::ClusterName;
use thiserror::Error;

/// Errors of a [`ClusterProvider`](crate::ClusterProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Client could not be built from the connection config
    #[error("Failed to build client for {cluster}: {source}")]
    Client {
        /// Cluster the client was meant for
        cluster: ClusterName,
        /// Underlying error
        #[source]
        source: kube::Error,
    },

    /// Cancellation fired before every cache finished its initial list
    #[error("Cache sync for {0} cancelled")]
    SyncCancelled(ClusterName),

    /// Caches did not sync within the configured timeout
    #[error("Cache sync for {0} timed out")]
    SyncTimeout(ClusterName),

    /// A reflector went away before its cache became ready
    #[error("Cache for {kind} in {cluster} closed before it synced")]
    CacheClosed {
        /// Cluster of the cache
        cluster: ClusterName,
        /// Kind watched by the cache
        kind: String,
    },
}

/// Errors while discovering seeds or resolving their kubeconfigs.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be parsed or turned into a client config
    #[error("Invalid kubeconfig for seed {seed}: {message}")]
    Kubeconfig {
        /// Seed name
        seed: String,
        /// What went wrong
        message: String,
    },

    /// The kubeconfig Secret or one of its keys is missing
    #[error("Kubeconfig for seed {seed} not found: {message}")]
    KubeconfigNotFound {
        /// Seed name
        seed: String,
        /// What is missing
        message: String,
    },

    /// Datacenters file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Datacenters file is not valid YAML
    #[error("Invalid datacenters file {path}: {source}")]
    Datacenters {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors of a [`ControllerManager`](crate::ControllerManager).
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A controller with this name is already registered
    #[error("Controller {0} is already registered")]
    DuplicateController(String),

    /// The manager was already started
    #[error("Controller manager for {0} is already running")]
    AlreadyStarted(ClusterName),

    /// A provider failed to start or sync
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Errors returned by [`ControllerFactory::install`](crate::ControllerFactory::install).
#[derive(Debug, Error)]
pub enum FactoryError {
    /// Provider construction or registration failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Runnable registration failed
    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// Anything else the factory considers fatal for this install
    #[error("{0}")]
    Install(String),
}

/// Reasons a seed could not be brought up in a lifecycle pass.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Kubeconfig resolution failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Provider could not be built
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A controller factory failed
    #[error("Controller factory failed for {cluster}: {source}")]
    Factory {
        /// Cluster the factory was installed into
        cluster: ClusterName,
        /// Underlying error
        #[source]
        source: FactoryError,
    },

    /// The manager failed to start
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Errors of the leader election gate.
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The Lease object is malformed
    #[error("Invalid lease {0}: {1}")]
    InvalidLease(String, String),
}
