//! Gantry operator - single-device edge workload orchestration

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gantry::backup::{BackupStore, SecretBackupStore};
use gantry::client::{KubeWorkloadClient, WorkloadClient};
use gantry::config::{ExternalServiceMode, OperatorConfig};
use gantry::crd::EdgeDeployment;
use gantry::identity::{IdentityProvider, LocalIdentityProvider};
use gantry::reconcile::EdgeReconciler;
use gantry::status::StatusTracker;
use gantry::watch::{EventHandler, KubeWatchSource, WatchDelta, WatchManager};

/// Gantry - converges one device's workloads onto a Kubernetes cluster
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about, long_about = None)]
struct Cli {
    /// Generate the EdgeDeployment CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Device id as registered with the hub
    #[arg(long, env = "GANTRY_DEVICE_ID")]
    device_id: Option<String>,

    /// Hub the device belongs to
    #[arg(long, env = "GANTRY_HUB_NAME")]
    hub_name: Option<String>,

    /// Namespace all generated objects live in
    #[arg(long, env = "GANTRY_NAMESPACE", default_value = "gantry")]
    namespace: String,

    /// Proxy sidecar image injected into every workload
    #[arg(long, env = "GANTRY_PROXY_IMAGE")]
    proxy_image: Option<String>,

    /// Service type for host-port exposures: NodePort or LoadBalancer
    #[arg(long, env = "GANTRY_EXTERNAL_MODE", default_value = "NodePort")]
    external_mode: String,

    /// Seconds between forced re-list reconciles
    #[arg(long, env = "GANTRY_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Module name the operator itself runs as, if it runs as one
    #[arg(long, env = "GANTRY_SELF_MODULE")]
    self_module: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&EdgeDeployment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{}", crd);
        return Ok(());
    }

    run_operator(cli).await
}

async fn run_operator(cli: Cli) -> anyhow::Result<()> {
    let device_id = cli
        .device_id
        .ok_or_else(|| anyhow::anyhow!("--device-id (or GANTRY_DEVICE_ID) is required"))?;
    let hub_name = cli
        .hub_name
        .ok_or_else(|| anyhow::anyhow!("--hub-name (or GANTRY_HUB_NAME) is required"))?;

    let mut config = OperatorConfig::resolve(device_id, hub_name, cli.namespace)?;
    if let Some(image) = cli.proxy_image {
        config.proxy.image = image;
    }
    config.external_mode = ExternalServiceMode::parse(&cli.external_mode)?;
    config.resync_interval = Duration::from_secs(cli.resync_secs);
    config.self_module = cli.self_module;

    info!(
        device = %config.device,
        hub = %config.hub,
        namespace = %config.namespace,
        document = %config.resource_name,
        "starting gantry operator"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let workloads: Arc<dyn WorkloadClient> =
        Arc::new(KubeWorkloadClient::new(client.clone(), &config.namespace));
    let identity: Arc<dyn IdentityProvider> =
        Arc::new(LocalIdentityProvider::new(&config.device_id));
    let backup: Arc<dyn BackupStore> = Arc::new(SecretBackupStore::new(
        client.clone(),
        &config.namespace,
        config.backup_secret_name(),
    ));
    let tracker = Arc::new(StatusTracker::new(&config, workloads.clone()));
    let engine = Arc::new(EdgeReconciler::new(
        config.clone(),
        workloads,
        identity,
        backup,
    ));

    // Converge to the last-known-good state before anything else answers.
    engine.bootstrap().await;

    let token = CancellationToken::new();
    let documents: Api<EdgeDeployment> = Api::namespaced(client.clone(), &config.namespace);

    let document_watch = WatchManager::new(
        "documents",
        Arc::new(KubeWatchSource::new(documents.clone())),
        engine.clone(),
    )
    .start(token.clone())
    .await
    .map_err(|e| anyhow::anyhow!("Failed to open the document watch: {}", e))?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);
    let pod_watch = WatchManager::new(
        "pods",
        Arc::new(KubeWatchSource::with_labels(pods, config.owner_selector())),
        tracker,
    )
    .start(token.clone())
    .await
    .map_err(|e| anyhow::anyhow!("Failed to open the pod watch: {}", e))?;

    let resync = tokio::spawn(run_resync(
        documents,
        engine,
        config.resource_name.clone(),
        config.resync_interval,
        token.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = document_watch => error!("document watch ended unexpectedly"),
        _ = pod_watch => error!("pod watch ended unexpectedly"),
        _ = resync => error!("resync loop ended unexpectedly"),
    }

    token.cancel();
    info!("gantry operator stopped");
    Ok(())
}

/// Install or update the EdgeDeployment CRD via server-side apply
///
/// Runs on every start so the stored schema always matches the binary.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(gantry::FIELD_MANAGER).force();

    info!("Installing EdgeDeployment CRD...");
    crds.patch(
        "edgedeployments.gantry.dev",
        &params,
        &Patch::Apply(&EdgeDeployment::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install EdgeDeployment CRD: {}", e))?;
    info!("EdgeDeployment CRD installed");
    Ok(())
}

/// Replay the device document into the engine on a timer
///
/// Watches can miss events across long disconnects; the timer bounds how
/// stale the cluster can get.
async fn run_resync(
    documents: Api<EdgeDeployment>,
    engine: Arc<EdgeReconciler>,
    name: String,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately and bootstrap already ran
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match documents.get_opt(&name).await {
            Ok(Some(doc)) => {
                debug!("resync tick, replaying current document");
                if let Err(error) = engine.handle(WatchDelta::Applied(doc)).await {
                    warn!(%error, "resync reconcile failed");
                }
            }
            Ok(None) => debug!("resync tick, no document present"),
            Err(error) => warn!(%error, "resync fetch failed"),
        }
    }
}
