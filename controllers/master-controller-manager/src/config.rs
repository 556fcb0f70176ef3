//! Configuration from environment variables.

use crate::error::ControllerError;
use seed_lifecycle::{ControllerSettings, LeaderElectionConfig, worker_label_selector};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default namespace of the fleet's own resources
pub const DEFAULT_NAMESPACE: &str = "kubermatic";
/// Default address of the metrics endpoint
pub const DEFAULT_METRICS_ADDRESS: &str = "127.0.0.1:8085";

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master kubeconfig; in-cluster or default discovery when unset
    pub kubeconfig: Option<PathBuf>,
    /// Namespace holding `Seed` resources and the leader Lease
    pub namespace: String,
    /// Worker name for label sharding
    pub worker_name: Option<String>,
    /// Workers per controller
    pub worker_count: usize,
    /// Address of the `/metrics` endpoint
    pub metrics_address: SocketAddr,
    /// Static datacenters file
    pub datacenters_file: Option<PathBuf>,
    /// Read seeds from `Seed` resources instead of the datacenters file
    pub dynamic_datacenters: bool,
    /// Period of lifecycle passes and controller resyncs
    pub resync_interval: Duration,
    /// Upper bound for initial cache syncs
    pub cache_sync_timeout: Duration,
    /// Leader election timing
    pub election: LeaderElectionConfig,
    /// Debug logging
    pub log_debug: bool,
}

impl Config {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidConfig`] for unparsable values or
    /// inconsistent combinations.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let metrics_address = get("METRICS_ADDRESS")
            .unwrap_or_else(|| DEFAULT_METRICS_ADDRESS.to_string())
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("METRICS_ADDRESS: {e}")))?;

        let defaults = LeaderElectionConfig::default();
        let election = LeaderElectionConfig {
            lease_duration: seconds(&get, "LEASE_DURATION_SECS", defaults.lease_duration)?,
            renew_deadline: seconds(&get, "RENEW_DEADLINE_SECS", defaults.renew_deadline)?,
            retry_period: seconds(&get, "RETRY_PERIOD_SECS", defaults.retry_period)?,
        };
        election
            .validate()
            .map_err(|e| ControllerError::InvalidConfig(format!("leader election: {e}")))?;

        let worker_count = match get("WORKER_COUNT") {
            Some(value) => value
                .parse::<usize>()
                .ok()
                .filter(|count| *count > 0)
                .ok_or_else(|| ControllerError::InvalidConfig(format!("WORKER_COUNT must be a positive integer, got {value}")))?,
            None => 4,
        };

        let config = Self {
            kubeconfig: get("KUBECONFIG").map(PathBuf::from),
            namespace: get("NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            worker_name: get("WORKER_NAME"),
            worker_count,
            metrics_address,
            datacenters_file: get("DATACENTERS_FILE").map(PathBuf::from),
            dynamic_datacenters: flag(&get, "DYNAMIC_DATACENTERS")?,
            resync_interval: seconds(&get, "RESYNC_INTERVAL_SECS", Duration::from_secs(300))?,
            cache_sync_timeout: seconds(&get, "CACHE_SYNC_TIMEOUT_SECS", Duration::from_secs(60))?,
            election,
            log_debug: flag(&get, "LOG_DEBUG")?,
        };

        if !config.dynamic_datacenters {
            if config.datacenters_file.is_none() {
                return Err(ControllerError::InvalidConfig(
                    "DATACENTERS_FILE is required unless DYNAMIC_DATACENTERS=true".to_string(),
                ));
            }
            if config.kubeconfig.is_none() {
                return Err(ControllerError::InvalidConfig(
                    "KUBECONFIG with one context per seed is required for file based seeds".to_string(),
                ));
            }
        }
        Ok(config)
    }

    /// Settings handed to every controller manager
    #[must_use]
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            namespace: self.namespace.clone(),
            worker_name: self.worker_name.clone(),
            label_selector: worker_label_selector(self.worker_name.as_deref()),
            worker_count: self.worker_count,
            resync_interval: self.resync_interval,
            cache_sync_timeout: self.cache_sync_timeout,
            ..Default::default()
        }
    }
}

fn seconds(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration, ControllerError> {
    match get(key) {
        Some(value) => value
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| ControllerError::InvalidConfig(format!("{key} must be a positive number of seconds, got {value}"))),
        None => Ok(default),
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool, ControllerError> {
    match get(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("false" | "0" | "no") => Ok(false),
        Some("true" | "1" | "yes") => Ok(true),
        Some(other) => Err(ControllerError::InvalidConfig(format!("{key} must be true or false, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ControllerError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_with_dynamic_datacenters() {
        let config = config(&[("DYNAMIC_DATACENTERS", "true")]).unwrap();

        assert_eq!(config.namespace, "kubermatic");
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.metrics_address.to_string(), "127.0.0.1:8085");
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.election, LeaderElectionConfig::default());
        assert!(!config.log_debug);
    }

    #[test]
    fn test_file_seeds_need_datacenters_and_kubeconfig() {
        assert!(matches!(config(&[]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(
            config(&[("DATACENTERS_FILE", "/etc/fleet/datacenters.yaml")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        let config = config(&[
            ("DATACENTERS_FILE", "/etc/fleet/datacenters.yaml"),
            ("KUBECONFIG", "/etc/fleet/kubeconfig"),
        ])
        .unwrap();
        assert!(!config.dynamic_datacenters);
    }

    #[test]
    fn test_worker_name_drives_label_selector() {
        let config = config(&[("DYNAMIC_DATACENTERS", "1"), ("WORKER_NAME", "alice"), ("WORKER_COUNT", "8")]).unwrap();
        let settings = config.controller_settings();

        assert_eq!(settings.label_selector.as_deref(), Some("worker-name=alice"));
        assert_eq!(settings.worker_count, 8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("DYNAMIC_DATACENTERS", "true"), ("WORKER_COUNT", "0")],
            [("DYNAMIC_DATACENTERS", "true"), ("METRICS_ADDRESS", "not-an-address")],
            [("DYNAMIC_DATACENTERS", "maybe"), ("LOG_DEBUG", "false")],
            [("DYNAMIC_DATACENTERS", "true"), ("RENEW_DEADLINE_SECS", "30")],
        ] {
            assert!(matches!(config(&vars), Err(ControllerError::InvalidConfig(_))), "{vars:?}");
        }
    }
}
