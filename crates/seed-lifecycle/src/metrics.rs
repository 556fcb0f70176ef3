//! Prometheus metrics of the seed lifecycle
//!
//! Metrics are created unregistered; the binary registers them on its
//! [`Registry`] once at startup.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use reconciling::ReconcileReport;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

const NAMESPACE: &str = "fleet";
const SUBSYSTEM: &str = "master_controller_manager";

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE).subsystem(SUBSYSTEM)
}

fn register_all(registry: &Registry, collectors: Vec<Box<dyn prometheus::core::Collector>>) -> prometheus::Result<()> {
    for collector in collectors {
        match registry.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Per-seed kubeconfig retrieval gauge.
///
/// After every [`apply`](Self::apply) the gauge holds exactly one sample
/// per seed of the snapshot; seeds that disappeared lose their sample.
/// Registered as a collector that takes the same lock as `apply`, so a
/// scrape never sees half of a snapshot.
#[derive(Debug, Clone)]
pub struct SeedKubeconfigHealth {
    gauge: IntGaugeVec,
    tracked: Arc<Mutex<BTreeSet<String>>>,
}

impl SeedKubeconfigHealth {
    fn new() -> Self {
        let gauge = IntGaugeVec::new(
            opts(
                "seed_kubeconfig_retrieval_success",
                "Whether the kubeconfig of a seed was retrieved and its controllers started (1) or not (0)",
            ),
            &["seed"],
        )
        .expect("valid seed_kubeconfig_retrieval_success metric");
        Self {
            gauge,
            tracked: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Replace the gauge contents with `snapshot` (seed name to success)
    pub fn apply(&self, snapshot: &BTreeMap<String, bool>) {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        for (seed, ok) in snapshot {
            self.gauge.with_label_values(&[seed.as_str()]).set(i64::from(*ok));
        }
        for stale in tracked.iter().filter(|seed| !snapshot.contains_key(*seed)) {
            // Already absent when a previous apply failed half way
            let _ = self.gauge.remove_label_values(&[stale.as_str()]);
        }
        *tracked = snapshot.keys().cloned().collect();
    }

    /// Current samples, seed name to value
    pub fn samples(&self) -> BTreeMap<String, i64> {
        let tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        tracked
            .iter()
            .map(|seed| (seed.clone(), self.gauge.with_label_values(&[seed.as_str()]).get()))
            .collect()
    }
}

impl Collector for SeedKubeconfigHealth {
    fn desc(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        self.gauge.collect()
    }
}

/// Metrics written by the [`SeedLifecycleManager`](crate::SeedLifecycleManager).
#[derive(Debug)]
pub struct SeedLifecycleMetrics {
    /// Kubeconfig retrieval success per seed
    pub seed_kubeconfig: SeedKubeconfigHealth,
    /// Number of seeds per lifecycle state
    pub seeds: IntGaugeVec,
    /// Lifecycle passes by result
    pub passes: IntCounterVec,
}

impl Default for SeedLifecycleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedLifecycleMetrics {
    /// Create unregistered metrics
    #[must_use]
    pub fn new() -> Self {
        Self {
            seed_kubeconfig: SeedKubeconfigHealth::new(),
            seeds: IntGaugeVec::new(opts("seeds", "Number of seeds per lifecycle state"), &["state"])
                .expect("valid seeds metric"),
            passes: IntCounterVec::new(opts("lifecycle_passes_total", "Seed lifecycle passes by result"), &["result"])
                .expect("valid lifecycle_passes_total metric"),
        }
    }

    /// Register on `registry`; registering twice is not an error
    ///
    /// # Errors
    ///
    /// Returns the registry error for anything but a duplicate registration.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        register_all(
            registry,
            vec![
                Box::new(self.seed_kubeconfig.clone()),
                Box::new(self.seeds.clone()),
                Box::new(self.passes.clone()),
            ],
        )
    }
}

/// Metrics written by controllers that reconcile objects.
#[derive(Debug)]
pub struct ReconcileMetrics {
    /// Reconcile outcomes per cluster, kind and outcome
    pub outcomes: IntCounterVec,
    /// Number of busy RBAC workers
    pub rbac_workers: IntGauge,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileMetrics {
    /// Create unregistered metrics
    #[must_use]
    pub fn new() -> Self {
        Self {
            outcomes: IntCounterVec::new(
                opts("reconcile_outcomes_total", "Object reconcile outcomes"),
                &["cluster", "kind", "outcome"],
            )
            .expect("valid reconcile_outcomes_total metric"),
            rbac_workers: IntGauge::with_opts(opts("rbac_workers_busy", "RBAC workers currently reconciling"))
                .expect("valid rbac_workers_busy metric"),
        }
    }

    /// Register on `registry`; registering twice is not an error
    ///
    /// # Errors
    ///
    /// Returns the registry error for anything but a duplicate registration.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        register_all(
            registry,
            vec![Box::new(self.outcomes.clone()), Box::new(self.rbac_workers.clone())],
        )
    }

    /// Count every result of `report` against `cluster`
    pub fn record(&self, cluster: &str, report: &ReconcileReport) {
        for result in &report.results {
            self.outcomes
                .with_label_values(&[cluster, result.kind, result.outcome.as_str()])
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};
    use reconciling::{ObjectResult, ReconcileOutcome};

    fn render(registry: &Registry) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    fn snapshot(entries: &[(&str, bool)]) -> BTreeMap<String, bool> {
        entries.iter().map(|(name, ok)| ((*name).to_string(), *ok)).collect()
    }

    #[test]
    fn test_gauge_tracks_latest_snapshot() {
        let metrics = SeedLifecycleMetrics::new();
        let health = &metrics.seed_kubeconfig;

        health.apply(&snapshot(&[("a", true), ("b", false)]));
        assert_eq!(health.samples(), BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 0)]));

        health.apply(&snapshot(&[("a", true)]));
        assert_eq!(health.samples(), BTreeMap::from([("a".to_string(), 1)]));

        health.apply(&BTreeMap::new());
        assert!(health.samples().is_empty());
    }

    #[test]
    fn test_removed_seed_disappears_from_exposition() {
        let registry = Registry::new();
        let metrics = SeedLifecycleMetrics::new();
        metrics.register(&registry).unwrap();

        metrics.seed_kubeconfig.apply(&snapshot(&[("a", true), ("b", false)]));
        let text = render(&registry);
        assert!(text.contains(r#"fleet_master_controller_manager_seed_kubeconfig_retrieval_success{seed="b"} 0"#));

        metrics.seed_kubeconfig.apply(&snapshot(&[("a", true)]));
        let text = render(&registry);
        assert!(text.contains(r#"seed_kubeconfig_retrieval_success{seed="a"} 1"#));
        assert!(!text.contains(r#"seed="b""#));
    }

    #[test]
    fn test_scrape_sees_whole_snapshots() {
        let registry = Registry::new();
        let metrics = SeedLifecycleMetrics::new();
        metrics.register(&registry).unwrap();
        let first = snapshot(&[("a", true), ("b", false)]);
        let second = snapshot(&[("c", true)]);
        metrics.seed_kubeconfig.apply(&first);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..2000 {
                    metrics.seed_kubeconfig.apply(if round % 2 == 0 { &second } else { &first });
                }
            });
            for _ in 0..2000 {
                let text = render(&registry);
                let seeds: BTreeSet<String> = text
                    .lines()
                    .filter_map(|line| line.strip_prefix("fleet_master_controller_manager_seed_kubeconfig_retrieval_success{seed=\""))
                    .filter_map(|rest| rest.split('"').next())
                    .map(str::to_string)
                    .collect();
                let seeds: Vec<&str> = seeds.iter().map(String::as_str).collect();
                assert!(seeds == ["a", "b"] || seeds == ["c"], "partial snapshot scraped: {seeds:?}");
            }
        });
    }

    #[test]
    fn test_double_registration_is_ok() {
        let registry = Registry::new();
        let metrics = ReconcileMetrics::new();
        metrics.register(&registry).unwrap();
        metrics.register(&registry).unwrap();
    }

    #[test]
    fn test_record_counts_outcomes() {
        let metrics = ReconcileMetrics::new();
        let report = ReconcileReport {
            results: vec![
                ObjectResult {
                    kind: "ClusterRole",
                    namespace: None,
                    name: "fleet:project-a:owners".to_string(),
                    outcome: ReconcileOutcome::Created,
                    error: None,
                },
                ObjectResult {
                    kind: "ClusterRole",
                    namespace: None,
                    name: "fleet:project-a:viewers".to_string(),
                    outcome: ReconcileOutcome::Created,
                    error: None,
                },
            ],
        };

        metrics.record("master", &report);

        let created = metrics
            .outcomes
            .with_label_values(&["master", "ClusterRole", "created"])
            .get();
        assert_eq!(created, 2);
    }
}
