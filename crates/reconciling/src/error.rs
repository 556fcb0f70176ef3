//! Reconciliation errors.
//!
//! `StoreError` classifies what the API server (or the in-memory mock) said,
//! `ReconcileError` is what the engine reports for one object.

use thiserror::Error;

/// Errors returned by an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create raced with another creator
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency mismatch on update
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Timeouts, throttling and server-side hiccups; worth retrying
    #[error("Transient API error: {0}")]
    Transient(String),

    /// Any other API rejection
    #[error("Kubernetes API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the error is worth retrying with backoff at the client layer.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => {
                let message = response.message.clone();
                match (response.code, response.reason.as_str()) {
                    (404, _) => Self::NotFound(message),
                    (409, "AlreadyExists") => Self::AlreadyExists(message),
                    (409, _) => Self::Conflict(message),
                    (429 | 500..=599, _) => Self::Transient(message),
                    _ => Self::Api(message),
                }
            }
            kube::Error::HyperError(e) => Self::Transient(e.to_string()),
            kube::Error::Service(e) => Self::Transient(e.to_string()),
            kube::Error::SerdeError(e) => Self::Serialization(e),
            other => Self::Api(other.to_string()),
        }
    }
}

/// Errors that can occur while reconciling one managed object.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading or writing the object failed
    #[error("API error for {object}: {source}")]
    Api {
        /// `kind namespace/name` of the object
        object: String,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    /// Every attempt hit an update conflict
    #[error("Giving up on {object} after {attempts} conflicting update attempts")]
    ConflictRetriesExhausted {
        /// `kind namespace/name` of the object
        object: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// The desired-state function refused to produce an object
    #[error("Desired state for {object} could not be built: {message}")]
    Desired {
        /// `kind namespace/name` of the object
        object: String,
        /// Message from the desired-state function
        message: String,
    },

    /// The desired-state function renamed or moved the object
    #[error("Desired state for {object} changed the object's name or namespace")]
    IdentityChanged {
        /// `kind namespace/name` of the object
        object: String,
    },

    /// A batch finished with failures
    #[error("{failed} of {total} objects failed to reconcile: {summary}")]
    Batch {
        /// Number of failed objects
        failed: usize,
        /// Number of objects in the batch
        total: usize,
        /// First failures, joined
        summary: String,
    },
}

impl ReconcileError {
    /// Error for desired-state functions that cannot build their object.
    ///
    /// The engine fills in the object identity.
    pub fn desired(message: impl Into<String>) -> Self {
        Self::Desired {
            object: String::new(),
            message: message.into(),
        }
    }

    pub(crate) fn for_object(self, object: &str) -> Self {
        match self {
            Self::Desired { object: o, message } if o.is_empty() => Self::Desired {
                object: object.to_string(),
                message,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Transient("throttled".to_string()).is_transient());
        assert!(!StoreError::Conflict("rv".to_string()).is_transient());
    }

    #[test]
    fn test_desired_error_gets_object_identity() {
        let error = ReconcileError::desired("missing image").for_object("ConfigMap ns/cm");
        assert_eq!(
            error.to_string(),
            "Desired state for ConfigMap ns/cm could not be built: missing image"
        );
    }
}
