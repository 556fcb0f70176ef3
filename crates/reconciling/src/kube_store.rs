//! [`ObjectStore`] backed by a Kubernetes API server.

use crate::backoff::FibonacciBackoff;
use crate::error::StoreError;
use crate::kind::{ManagedKind, describe};
use crate::store::ObjectStore;
use kube::api::{Api, ApiResource, DynamicObject, PostParams};
use kube::Client;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts made for one request when the API server answers transiently.
const DEFAULT_TRANSIENT_ATTEMPTS: u32 = 4;

/// Object store talking to one cluster through a [`kube::Client`].
///
/// Requests go through the dynamic API so one implementation serves both
/// namespaced and cluster-scoped kinds. Throttling and 5xx answers are retried
/// with Fibonacci backoff; everything else is returned to the caller.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
    transient_attempts: u32,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl std::fmt::Debug for KubeObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectStore")
            .field("transient_attempts", &self.transient_attempts)
            .finish_non_exhaustive()
    }
}

impl KubeObjectStore {
    /// Create a store for the cluster behind `client`
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            transient_attempts: DEFAULT_TRANSIENT_ATTEMPTS,
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }

    /// Override how many times a transiently failing request is tried
    #[must_use]
    pub fn with_transient_attempts(mut self, attempts: u32) -> Self {
        self.transient_attempts = attempts.max(1);
        self
    }

    /// Underlying client
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: ManagedKind>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        match namespace {
            Some(ns) if K::NAMESPACED => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut request: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, kube::Error>>,
    {
        let mut backoff = FibonacciBackoff::new(self.backoff_min, self.backoff_max);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match request().await.map_err(StoreError::from) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.transient_attempts => {
                    let delay = backoff.next_backoff();
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Transient API error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn to_dynamic<K: ManagedKind>(object: &K) -> Result<DynamicObject, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

fn from_dynamic<K: ManagedKind>(object: DynamicObject) -> Result<K, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

fn object_name<K: ManagedKind>(object: &K) -> Result<String, StoreError> {
    object
        .meta()
        .name
        .clone()
        .ok_or_else(|| StoreError::Api(format!("{} without a name", K::kind(&()))))
}

#[async_trait::async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get<K: ManagedKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        let api = self.api::<K>(namespace);
        let what = describe::<K>(namespace, name);
        debug!("Fetching {}", what);
        let found = self.with_retry(&what, || api.get_opt(name)).await?;
        found.map(from_dynamic).transpose()
    }

    async fn create<K: ManagedKind>(&self, namespace: Option<&str>, object: &K) -> Result<K, StoreError> {
        let api = self.api::<K>(namespace);
        let name = object_name(object)?;
        let what = describe::<K>(namespace, &name);
        let body = to_dynamic(object)?;
        let params = PostParams::default();
        debug!("Creating {}", what);
        let created = self.with_retry(&what, || api.create(&params, &body)).await?;
        from_dynamic(created)
    }

    async fn replace<K: ManagedKind>(&self, namespace: Option<&str>, object: &K) -> Result<K, StoreError> {
        let api = self.api::<K>(namespace);
        let name = object_name(object)?;
        let what = describe::<K>(namespace, &name);
        let body = to_dynamic(object)?;
        let params = PostParams::default();
        debug!("Replacing {}", what);
        let replaced = self.with_retry(&what, || api.replace(&name, &params, &body)).await?;
        from_dynamic(replaced)
    }
}
