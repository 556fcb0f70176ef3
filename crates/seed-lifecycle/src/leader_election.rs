//! Leader election using Kubernetes Leases
//!
//! At most one process holds the lease of an election at a time. The holder
//! runs its work on a child token that is cancelled as soon as a renewal
//! fails, or no renewal succeeded within the renew deadline.
//!
//! # Atomicity
//!
//! [`KubeLeaseLock`] uses resourceVersion for compare-and-swap semantics. If
//! the lease changes between read and write, the write fails with 409
//! Conflict and the attempt counts as "not acquired".
//!
//! # Expiry
//!
//! Another holder's lease counts as expired once the same record (holder,
//! renewTime, resourceVersion) has been observed unchanged for a full lease
//! duration on the local monotonic clock. The remote renewTime is never
//! compared against the local wall clock.

use crate::error::LeaderElectionError;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default lease duration
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
/// Default renew deadline
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
/// Default retry period
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Election name for `controller`, sharded by `worker_name` if set
#[must_use]
pub fn election_name(controller: &str, worker_name: Option<&str>) -> String {
    match worker_name {
        Some(worker) if !worker.is_empty() => format!("{controller}-leader-election-{worker}"),
        _ => format!("{controller}-leader-election"),
    }
}

/// Holder identity `<hostname>_<suffix>`
#[must_use]
pub fn holder_identity(hostname: &str, suffix: &str) -> String {
    format!("{hostname}_{suffix}")
}

/// Exclusive, expiring lock an election campaigns on.
#[async_trait::async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquire the lock for `identity`, or renew it if `identity` holds it.
    ///
    /// Returns `Ok(false)` when another holder owns an unexpired lease.
    async fn try_acquire_or_renew(&self, identity: &str, lease_duration: Duration)
    -> Result<bool, LeaderElectionError>;

    /// Give the lock up if `identity` holds it
    async fn release(&self, identity: &str) -> Result<(), LeaderElectionError>;
}

/// The parts of a lease that change on every renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LeaseRecord {
    holder: String,
    renew_time: Option<chrono::DateTime<Utc>>,
    resource_version: String,
}

/// Last foreign lease record seen, and when it was first seen.
#[derive(Debug, Default)]
struct LeaseObserver {
    last: Option<(LeaseRecord, Instant)>,
}

impl LeaseObserver {
    /// Whether `record` has stayed unchanged for `lease_duration` of local time
    fn expired(&mut self, record: LeaseRecord, lease_duration: Duration) -> bool {
        match &self.last {
            Some((seen, since)) if *seen == record => since.elapsed() >= lease_duration,
            _ => {
                self.last = Some((record, Instant::now()));
                false
            }
        }
    }
}

/// [`LeaseLock`] on a `coordination.k8s.io/v1` Lease.
#[derive(Clone)]
pub struct KubeLeaseLock {
    client: Client,
    namespace: String,
    name: String,
    observed: Arc<Mutex<LeaseObserver>>,
}

impl std::fmt::Debug for KubeLeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseLock")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn duration_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

impl KubeLeaseLock {
    /// Lock on the Lease `name` in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            observed: Arc::new(Mutex::new(LeaseObserver::default())),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease(&self, identity: &str, lease_duration: Duration, resource_version: Option<String>, transitions: i32) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                lease_duration_seconds: Some(duration_seconds(lease_duration)),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn write(&self, lease: &Lease, create: bool) -> Result<bool, LeaderElectionError> {
        let api = self.api();
        let result = if create {
            api.create(&PostParams::default(), lease).await
        } else {
            api.replace(&self.name, &PostParams::default(), lease).await
        };
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = %self.name, "Lease changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError> {
        let Some(existing) = self.api().get_opt(&self.name).await? else {
            return self.write(&self.lease(identity, lease_duration, None, 0), true).await;
        };

        let resource_version = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::InvalidLease(self.name.clone(), "missing resourceVersion".to_string()))?;
        let spec = existing.spec.clone().unwrap_or_default();

        if spec.holder_identity.as_deref() == Some(identity) {
            let mut renewed = existing;
            let mut spec = spec;
            spec.renew_time = Some(MicroTime(Utc::now()));
            spec.lease_duration_seconds = Some(duration_seconds(lease_duration));
            renewed.spec = Some(spec);
            return self.write(&renewed, false).await;
        }

        if let Some(holder) = spec.holder_identity.clone().filter(|holder| !holder.is_empty()) {
            let record = LeaseRecord {
                holder,
                renew_time: spec.renew_time.as_ref().map(|time| time.0),
                resource_version: resource_version.clone(),
            };
            let duration = spec
                .lease_duration_seconds
                .and_then(|seconds| u64::try_from(seconds).ok())
                .map_or(lease_duration, Duration::from_secs);
            let expired = self
                .observed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .expired(record, duration);
            if !expired {
                return Ok(false);
            }
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        let acquired = self
            .write(&self.lease(identity, lease_duration, Some(resource_version), transitions), false)
            .await?;
        if acquired {
            info!(lease = %self.name, identity = %identity, transitions, "Took over lease");
        }
        Ok(acquired)
    }

    async fn release(&self, identity: &str) -> Result<(), LeaderElectionError> {
        let Some(mut lease) = self.api().get_opt(&self.name).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(identity) {
            debug!(lease = %self.name, "Not the lease holder, nothing to release");
            return Ok(());
        }
        spec.holder_identity = None;
        spec.acquire_time = None;
        spec.renew_time = None;
        self.write(&lease, false).await?;
        info!(lease = %self.name, "Lease released");
        Ok(())
    }
}

/// Timing of an election.
///
/// `renew_deadline` must be shorter than `lease_duration`, so the holder stops
/// working before another candidate may take the lease over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the holder keeps working without a successful renewal
    pub renew_deadline: Duration,
    /// Interval between acquisition and renewal attempts
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }
}

impl LeaderElectionConfig {
    /// Check the timing constraints
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.renew_deadline >= self.lease_duration {
            return Err("renew deadline must be shorter than the lease duration".to_string());
        }
        if self.retry_period.is_zero() || self.retry_period >= self.renew_deadline {
            return Err("retry period must be non-zero and shorter than the renew deadline".to_string());
        }
        Ok(())
    }
}

/// Why [`run_as_leader`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// The parent token fired, before or during leadership
    Cancelled,
    /// The work finished on its own while still leading
    Completed,
    /// Renewal failed; the work was cancelled and awaited
    LeadershipLost,
}

/// Campaign for `election`, then run `on_elected` while holding the lease.
///
/// Blocks until the lease is acquired or `token` fires. The work gets a
/// child token that is cancelled when leadership is lost; it must return
/// promptly after cancellation. The lease is released unless leadership was
/// lost.
pub async fn run_as_leader<L, F, Fut>(
    token: &CancellationToken,
    lock: &L,
    identity: &str,
    election: &str,
    config: LeaderElectionConfig,
    on_elected: F,
) -> ElectionOutcome
where
    L: LeaseLock + ?Sized,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = ()>,
{
    info!(election = %election, identity = %identity, "Waiting for leadership");
    loop {
        let attempt = tokio::select! {
            () = token.cancelled() => return ElectionOutcome::Cancelled,
            result = lock.try_acquire_or_renew(identity, config.lease_duration) => result,
        };
        match attempt {
            Ok(true) => break,
            Ok(false) => debug!(election = %election, "Lease held by another candidate"),
            Err(e) => warn!(election = %election, error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::select! {
            () = token.cancelled() => return ElectionOutcome::Cancelled,
            () = tokio::time::sleep(config.retry_period) => {}
        }
    }
    info!(election = %election, identity = %identity, "Leadership acquired");

    let child = token.child_token();
    let work = on_elected(child.clone());
    tokio::pin!(work);

    let renew = renew_until_lost(lock, identity, election, config);
    tokio::pin!(renew);

    let outcome = tokio::select! {
        () = &mut work => {
            if token.is_cancelled() {
                ElectionOutcome::Cancelled
            } else {
                ElectionOutcome::Completed
            }
        }
        () = &mut renew => {
            warn!(election = %election, identity = %identity, "Leadership lost");
            child.cancel();
            work.await;
            return ElectionOutcome::LeadershipLost;
        }
    };

    if let Err(e) = lock.release(identity).await {
        warn!(election = %election, error = %e, "Failed to release lease");
    }
    outcome
}

/// Renew every retry period; returns once leadership is lost
async fn renew_until_lost<L>(lock: &L, identity: &str, election: &str, config: LeaderElectionConfig)
where
    L: LeaseLock + ?Sized,
{
    let mut last_renewal = Instant::now();
    loop {
        tokio::time::sleep(config.retry_period).await;
        let remaining = config.renew_deadline.saturating_sub(last_renewal.elapsed());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, lock.try_acquire_or_renew(identity, config.lease_duration)).await {
            Ok(Ok(true)) => last_renewal = Instant::now(),
            Ok(Ok(false)) => return,
            Ok(Err(e)) => warn!(election = %election, error = %e, "Failed to renew lease"),
            Err(_) => debug!(election = %election, "Lease renewal timed out"),
        }
        if last_renewal.elapsed() >= config.renew_deadline {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory lease on the tokio clock
    #[derive(Default)]
    struct MemoryLock {
        holder: Mutex<Option<(String, Instant, Duration)>>,
        fail_renewals: AtomicBool,
    }

    #[async_trait::async_trait]
    impl LeaseLock for MemoryLock {
        async fn try_acquire_or_renew(
            &self,
            identity: &str,
            lease_duration: Duration,
        ) -> Result<bool, LeaderElectionError> {
            let mut holder = self.holder.lock().unwrap();
            let now = Instant::now();
            match holder.as_ref() {
                Some((current, _, _)) if current == identity => {
                    if self.fail_renewals.load(Ordering::SeqCst) {
                        return Ok(false);
                    }
                }
                Some((_, renewed, duration)) if now < *renewed + *duration => return Ok(false),
                _ => {}
            }
            *holder = Some((identity.to_string(), now, lease_duration));
            Ok(true)
        }

        async fn release(&self, identity: &str) -> Result<(), LeaderElectionError> {
            let mut holder = self.holder.lock().unwrap();
            if holder.as_ref().is_some_and(|(current, _, _)| current == identity) {
                *holder = None;
            }
            Ok(())
        }
    }

    #[test]
    fn test_election_name() {
        assert_eq!(
            election_name("master-controller-manager", None),
            "master-controller-manager-leader-election"
        );
        assert_eq!(
            election_name("master-controller-manager", Some("alice")),
            "master-controller-manager-leader-election-alice"
        );
        assert_eq!(holder_identity("node-1", "abc"), "node-1_abc");
    }

    fn record(holder: &str, resource_version: &str, renew_time: chrono::DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            holder: holder.to_string(),
            renew_time: Some(renew_time),
            resource_version: resource_version.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_looking_renew_time_is_not_expired_yet() {
        // The holder's clock runs an hour behind ours
        let skewed = Utc::now() - chrono::Duration::hours(1);
        let mut observer = LeaseObserver::default();
        let duration = Duration::from_secs(15);

        assert!(!observer.expired(record("a", "7", skewed), duration));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!observer.expired(record("a", "7", skewed), duration));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(observer.expired(record("a", "7", skewed), duration));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_restarts_the_observation() {
        let renewed = Utc::now();
        let mut observer = LeaseObserver::default();
        let duration = Duration::from_secs(15);

        assert!(!observer.expired(record("a", "7", renewed), duration));
        tokio::time::advance(Duration::from_secs(14)).await;
        // Renewed with a future-dated renewTime; only the change matters
        let renewed = renewed + chrono::Duration::hours(1);
        assert!(!observer.expired(record("a", "8", renewed), duration));
        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(!observer.expired(record("a", "8", renewed), duration));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(observer.expired(record("a", "8", renewed), duration));
    }

    #[test]
    fn test_config_validation() {
        assert!(LeaderElectionConfig::default().validate().is_ok());
        let config = LeaderElectionConfig {
            renew_deadline: Duration::from_secs(20),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_candidate_leads() {
        let lock = Arc::new(MemoryLock::default());
        let leaders = Arc::new(AtomicUsize::new(0));
        let max_leaders = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let mut candidates = Vec::new();
        for id in ["a", "b", "c"] {
            let lock = Arc::clone(&lock);
            let leaders = Arc::clone(&leaders);
            let max_leaders = Arc::clone(&max_leaders);
            let token = token.clone();
            candidates.push(tokio::spawn(async move {
                run_as_leader(&token, lock.as_ref(), id, "test", LeaderElectionConfig::default(), |work| async move {
                    let current = leaders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_leaders.fetch_max(current, Ordering::SeqCst);
                    work.cancelled().await;
                    leaders.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        token.cancel();
        for candidate in candidates {
            assert_eq!(candidate.await.unwrap(), ElectionOutcome::Cancelled);
        }
        assert_eq!(max_leaders.load(Ordering::SeqCst), 1);
        assert!(lock.holder.lock().unwrap().is_none(), "leader releases on shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_takes_over_after_leader_dies() {
        let lock = Arc::new(MemoryLock::default());
        let config = LeaderElectionConfig::default();

        let first = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                let token = CancellationToken::new();
                run_as_leader(&token, lock.as_ref(), "a", "test", config, |work| async move {
                    work.cancelled().await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Crash without releasing
        first.abort();
        let crashed_at = Instant::now();

        let elected = Arc::new(Mutex::new(None));
        let token = CancellationToken::new();
        let second = {
            let lock = Arc::clone(&lock);
            let elected = Arc::clone(&elected);
            let token = token.clone();
            tokio::spawn(async move {
                run_as_leader(&token, lock.as_ref(), "b", "test", config, |work| async move {
                    *elected.lock().unwrap() = Some(Instant::now());
                    work.cancelled().await;
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        let elected_at = elected.lock().unwrap().expect("standby was never elected");
        assert!(elected_at - crashed_at <= config.lease_duration + config.retry_period);

        token.cancel();
        second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_cancels_work() {
        let lock = Arc::new(MemoryLock::default());
        let token = CancellationToken::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let election = {
            let lock = Arc::clone(&lock);
            let stopped = Arc::clone(&stopped);
            let token = token.clone();
            tokio::spawn(async move {
                run_as_leader(&token, lock.as_ref(), "a", "test", LeaderElectionConfig::default(), |work| async move {
                    work.cancelled().await;
                    stopped.store(true, Ordering::SeqCst);
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        lock.fail_renewals.store(true, Ordering::SeqCst);

        assert_eq!(election.await.unwrap(), ElectionOutcome::LeadershipLost);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_work_releases_lease() {
        let lock = MemoryLock::default();
        let token = CancellationToken::new();

        let outcome = run_as_leader(&token, &lock, "a", "test", LeaderElectionConfig::default(), |_| async {}).await;

        assert_eq!(outcome, ElectionOutcome::Completed);
        assert!(lock.holder.lock().unwrap().is_none());
    }
}
