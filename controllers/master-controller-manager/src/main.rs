//! Master Controller Manager
//!
//! Runs the fleet controllers against the master cluster and every seed:
//! - Seed lifecycle: connects to each seed and starts its controllers
//! - RBAC controller: propagates project roles to the master and all seeds
//! - Project namespace synchronizer: ensures project namespaces per seed
//! - Seed synchronizer: mirrors each seed's `Seed` resource into the seed
//!
//! Only the elected leader runs controllers.

mod config;
mod error;
mod metrics_server;
mod project_sync;
mod rbac;
mod seed_sync;

use crate::config::Config;
use crate::error::ControllerError;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use project_sync::ProjectNamespaceFactory;
use prometheus::Registry;
use rbac::RbacControllerFactory;
use seed_sync::SeedSyncFactory;
use seed_lifecycle::{
    ClusterConnection, ClusterName, ControllerFactory, CrdSeedsGetter, DatacentersFileSeedsGetter, ElectionOutcome,
    KubeLeaseLock, KubeSeedStatusReporter, KubeconfigFileGetter, ReconcileMetrics, SecretKubeconfigGetter,
    SeedKubeconfigGetter, SeedLifecycleManager, SeedLifecycleMetrics, SeedRegistry, SeedsGetter, election_name,
    holder_identity, run_as_leader, spawn_seed_watch,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONTROLLER_NAME: &str = "master-controller-manager";
const MASTER_CLUSTER: &str = "master";

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let config = Config::from_env()?;

    let default_level = if config.log_debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    info!("Starting Master Controller Manager");
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Worker name: {}", config.worker_name.as_deref().unwrap_or("<none>"));
    info!("  Workers per controller: {}", config.worker_count);
    info!("  Dynamic datacenters: {}", config.dynamic_datacenters);
    info!("  Metrics address: {}", config.metrics_address);

    // kube builds its TLS connectors on the process-level rustls provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    let client = master_client(&config).await?;
    let master = ClusterConnection {
        name: ClusterName::master(MASTER_CLUSTER),
        client: client.clone(),
    };

    let registry = Registry::new();
    let lifecycle_metrics = Arc::new(SeedLifecycleMetrics::new());
    lifecycle_metrics.register(&registry)?;
    let reconcile_metrics = Arc::new(ReconcileMetrics::new());
    reconcile_metrics.register(&registry)?;

    let listener = TcpListener::bind(config.metrics_address)
        .await
        .map_err(|source| ControllerError::Io {
            context: format!("binding metrics listener on {}", config.metrics_address),
            source,
        })?;
    let metrics_server = tokio::spawn(metrics_server::serve(listener, registry, token.clone()));

    let settings = config.controller_settings();
    let (seeds, kubeconfigs): (Arc<dyn SeedsGetter>, Arc<dyn SeedKubeconfigGetter>) = if config.dynamic_datacenters {
        (
            Arc::new(CrdSeedsGetter::new(client.clone(), &config.namespace, settings.label_selector.clone())),
            Arc::new(SecretKubeconfigGetter::new(client.clone(), &config.namespace)),
        )
    } else {
        let (Some(datacenters), Some(kubeconfig)) = (&config.datacenters_file, &config.kubeconfig) else {
            return Err(ControllerError::InvalidConfig(
                "file based seeds need DATACENTERS_FILE and KUBECONFIG".to_string(),
            ));
        };
        let getter = DatacentersFileSeedsGetter::new(datacenters, &config.namespace);
        // Fail fast on an unreadable datacenters file
        let initial = getter.get_seeds().await?;
        info!("Loaded {} seed(s) from {}", initial.len(), datacenters.display());
        (Arc::new(getter), Arc::new(KubeconfigFileGetter::new(kubeconfig)))
    };

    let factories: Vec<Arc<dyn ControllerFactory>> = vec![
        Arc::new(RbacControllerFactory::new(Arc::clone(&reconcile_metrics))),
        Arc::new(ProjectNamespaceFactory::new(Arc::clone(&reconcile_metrics))),
        Arc::new(SeedSyncFactory::new(Arc::clone(&reconcile_metrics))),
    ];

    let election = election_name(CONTROLLER_NAME, config.worker_name.as_deref());
    let hostname = hostname::get().map_err(|source| ControllerError::Io {
        context: "reading hostname".to_string(),
        source,
    })?;
    let identity = holder_identity(&hostname.to_string_lossy(), &uuid::Uuid::new_v4().to_string());
    let lock = KubeLeaseLock::new(client.clone(), &config.namespace, &election);

    loop {
        let outcome = run_as_leader(&token, &lock, &identity, &election, config.election, |term| {
            let mut lifecycle = SeedLifecycleManager::new(
                master.clone(),
                SeedRegistry::new(Arc::clone(&seeds), Arc::clone(&kubeconfigs)),
                factories.clone(),
                settings.clone(),
                Arc::clone(&lifecycle_metrics),
            );
            let watch = if config.dynamic_datacenters {
                lifecycle = lifecycle.with_status_reporter(Arc::new(KubeSeedStatusReporter::new(client.clone())));
                Some(spawn_seed_watch(
                    client.clone(),
                    &config.namespace,
                    settings.label_selector.clone(),
                    lifecycle.trigger(),
                    term.clone(),
                ))
            } else {
                None
            };
            async move {
                lifecycle.run(term).await;
                if let Some(watch) = watch {
                    let _ = watch.await;
                }
            }
        })
        .await;

        match outcome {
            ElectionOutcome::LeadershipLost => {
                warn!("Leadership lost, stopped all controllers; campaigning again");
            }
            ElectionOutcome::Cancelled | ElectionOutcome::Completed => break,
        }
    }

    token.cancel();
    let _ = metrics_server.await;
    info!("Master Controller Manager stopped");
    Ok(())
}

/// Client for the master cluster: the configured kubeconfig, or inferred
async fn master_client(config: &Config) -> Result<Client, ControllerError> {
    let kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| ControllerError::Kubeconfig(format!("{}: {e}", path.display())))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| ControllerError::Kubeconfig(format!("{}: {e}", path.display())))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| ControllerError::Kubeconfig(e.to_string()))?,
    };
    Ok(Client::try_from(kube_config)?)
}

/// Cancel `token` on SIGINT or SIGTERM
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
    token.cancel();
}
