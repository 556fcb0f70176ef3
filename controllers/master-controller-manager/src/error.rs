//! Controller-specific error types.
//!
//! Errors that end the process. Everything per seed or per object is
//! handled inside the lifecycle and the controllers and never reaches here.

use seed_lifecycle::RegistryError;
use thiserror::Error;

/// Errors that can occur in the Master Controller Manager.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The master kubeconfig could not be loaded
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Metrics could not be registered
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Seed discovery could not be set up
    #[error("Seed registry error: {0}")]
    Registry(#[from] RegistryError),

    /// I/O error, such as binding the metrics listener
    #[error("I/O error on {context}: {source}")]
    Io {
        /// What was being done
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}
