//! Kindling operator - ImageCache fan-out controller

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use kindling_common::crd::{ImageCache, ImageWarm};
use kindling_common::telemetry::{init_telemetry, TelemetryConfig};
use kindling_common::FIELD_MANAGER;
use kindling_operator::{error_policy, node_trigger, reconcile, Context, NodeEligibilityTracker};

/// Kindling - pre-warms container images onto eligible cluster nodes
#[derive(Parser, Debug)]
#[command(name = "kindling-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let caches = serde_yaml::to_string(&ImageCache::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize ImageCache CRD: {}", e))?;
        let warms = serde_yaml::to_string(&ImageWarm::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize ImageWarm CRD: {}", e))?;
        println!("{caches}---\n{warms}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "kindling-operator".to_string(),
    })?;

    tracing::info!("Kindling operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let caches: Api<ImageCache> = Api::all(client.clone());
    let warms: Api<ImageWarm> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    let ctx = Arc::new(Context {
        client: client.clone(),
    });
    let tracker = Arc::new(NodeEligibilityTracker::default());

    tracing::info!("Starting ImageCache controller");

    let controller = Controller::new(caches, WatcherConfig::default());
    let store = controller.store();

    controller
        .owns(warms, WatcherConfig::default())
        .watches(nodes, WatcherConfig::default(), node_trigger(store, tracker))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "ImageCache reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "ImageCache reconciliation error"),
            }
        })
        .await;

    tracing::info!("Kindling operator shutting down");
    Ok(())
}

/// Install the Kindling CRDs on startup using server-side apply so the CRD
/// versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing ImageCache CRD...");
    crds.patch(
        "imagecaches.kindling.dev",
        &params,
        &Patch::Apply(&ImageCache::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install ImageCache CRD: {}", e))?;

    tracing::info!("Installing ImageWarm CRD...");
    crds.patch(
        "imagewarms.kindling.dev",
        &params,
        &Patch::Apply(&ImageWarm::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install ImageWarm CRD: {}", e))?;

    tracing::info!("All Kindling CRDs installed/updated");
    Ok(())
}
