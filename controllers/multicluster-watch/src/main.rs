//! Multicluster Watch Controller
//!
//! Watches Deployments and Pods on every cluster listed in `CLUSTERS_FILE`:
//! - Deployment: reconciled directly
//! - Pod: reconciled through its controller, in the same cluster or across
//!   clusters via the multicluster controller reference
//!
//! `SIGHUP` re-reads the cluster list and applies the changes; ctrl-c stops
//! every watch and exits.

mod config;
mod engine;
mod error;
mod fleet;
mod reconciler;

use crate::config::{Settings, load_clusters};
use crate::engine::KubeEngineFactory;
use crate::error::ControllerError;
use crate::fleet::{FleetDiff, start_each};
use crate::reconciler::LoggingReconciler;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use watch_job::{ClusterInfo, HookHandler, MappingMode, WatchJob, WatchOptions, WatchResource};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting Multicluster Watch Controller");

    let settings = Settings::from_env()?;
    info!("Configuration:");
    info!("  Clusters file: {}", settings.clusters_file.display());
    info!("  Namespace: {}", settings.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Grace period: {:?}", settings.grace_period);
    info!("  User agent: {}", settings.defaults.user_agent);

    let clusters = load_clusters(&settings.clusters_file)?;
    if clusters.is_empty() {
        warn!("No clusters configured, waiting for a reload");
    }

    let job = build_job(&settings)?;
    start_each(&job, &clusters).await;

    run_until_shutdown(&job, &settings, clusters).await?;

    info!("Shutting down");
    job.stop_all();
    Ok(())
}

fn build_job(settings: &Settings) -> Result<WatchJob, ControllerError> {
    let options = WatchOptions {
        namespace: settings.namespace.clone(),
        ..WatchOptions::default()
    };
    let resources = vec![
        WatchResource::of::<Deployment>(Arc::new(LoggingReconciler::new("Deployment"))).with_options(options.clone()),
        WatchResource::of::<Pod>(Arc::new(LoggingReconciler::new("Pod"))).with_options(WatchOptions {
            mapping: MappingMode::Controller {
                controller_context: String::new(),
            },
            ..options
        }),
    ];

    let mut job = WatchJob::new(settings.defaults.clone(), resources, Arc::new(KubeEngineFactory))?
        .with_grace_period(settings.grace_period);
    job.add_hook_handler(
        HookHandler::new()
            .on_succeeded(|cluster| info!(cluster = %cluster.key, endpoint = %cluster.endpoint, "Cluster watched"))
            .on_failed(|cluster, err| error!(cluster = %cluster.key, "Cluster watch failed: {}", err))
            .on_stopped(|cluster| info!(cluster = %cluster.key, "Cluster watch stopped")),
    );
    Ok(job)
}

#[cfg(unix)]
async fn run_until_shutdown(
    job: &WatchJob,
    settings: &Settings,
    mut clusters: Vec<ClusterInfo>,
) -> Result<(), ControllerError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.map_err(ControllerError::from),
            _ = hangup.recv() => {
                info!("Reloading {}", settings.clusters_file.display());
                let desired = match load_clusters(&settings.clusters_file) {
                    Ok(desired) => desired,
                    Err(e) => {
                        error!("Reload failed, keeping the current fleet: {}", e);
                        continue;
                    }
                };
                let diff = FleetDiff::between(&clusters, &desired);
                if diff.is_empty() {
                    info!("Cluster list unchanged");
                } else {
                    diff.apply(job).await;
                }
                clusters = desired;
            }
        }
    }
}

#[cfg(not(unix))]
async fn run_until_shutdown(
    _job: &WatchJob,
    _settings: &Settings,
    _clusters: Vec<ClusterInfo>,
) -> Result<(), ControllerError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
