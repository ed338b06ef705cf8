//! Kindling warmer - per-node image pull daemon

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use kindling_common::crd::ImageWarm;
use kindling_common::telemetry::{init_telemetry, TelemetryConfig};
use kindling_common::{Error, DEFAULT_PULL_SECRET, LABEL_NODE_NAME};
use kindling_warmer::cri::{DockerImageService, ImageService, DEFAULT_RUNTIME_ENDPOINT};
use kindling_warmer::{error_policy, reconcile, Context, SerialImagePuller};

/// Kindling warmer - pulls and keeps images warm on one node
#[derive(Parser, Debug)]
#[command(name = "kindling-warmer", version, about, long_about = None)]
struct Cli {
    /// Name of the node this warmer runs on (usually injected via the
    /// downward API)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Container runtime endpoint
    #[arg(long, default_value = DEFAULT_RUNTIME_ENDPOINT)]
    runtime_endpoint: String,

    /// Seconds a pull may show no progress before it is force-cancelled
    #[arg(long, default_value_t = 300)]
    progress_deadline_secs: u64,

    /// Pull secret name used when an ImageWarm references none
    #[arg(long, default_value = DEFAULT_PULL_SECRET)]
    default_pull_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "kindling-warmer".to_string(),
    })?;

    let node_name = cli
        .node_name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::config("node identity not set: pass --node-name or set NODE_NAME")
        })?;

    tracing::info!(node = %node_name, runtime = %cli.runtime_endpoint, "Kindling warmer starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    let service: Arc<dyn ImageService> =
        Arc::new(DockerImageService::new(&cli.runtime_endpoint)?);
    let puller = Arc::new(SerialImagePuller::new(
        service,
        Duration::from_secs(cli.progress_deadline_secs),
    ));

    let ctx = Arc::new(Context {
        client: client.clone(),
        puller,
        default_pull_secret: cli.default_pull_secret,
    });

    // Only this node's warms: the fan-out controller labels every warm
    // with its target node name
    let warms: Api<ImageWarm> = Api::all(client);
    let watcher_config =
        WatcherConfig::default().labels(&format!("{}={}", LABEL_NODE_NAME, node_name));

    tracing::info!("Starting ImageWarm controller");

    Controller::new(warms, watcher_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "ImageWarm reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "ImageWarm reconciliation error"),
            }
        })
        .await;

    tracing::info!("Kindling warmer shutting down");
    Ok(())
}
