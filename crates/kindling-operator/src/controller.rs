//! ImageCache reconciliation
//!
//! One pass over an ImageCache:
//! - deletion marker set → no-op (ImageWarms cascade via owner references)
//! - list nodes; ensure an ImageWarm per eligible node, ensure absence for
//!   ineligible nodes; the pass aborts at the first per-node error and the
//!   whole cache is retried (converged nodes stay converged)
//! - aggregate owned ImageWarm readiness into the cache's Ready condition

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use kindling_common::crd::{build_image_warm, warm_name, ImageCache, ImageWarm};
use kindling_common::kube_utils::patch_resource_status;
use kindling_common::node::node_eligible;
use kindling_common::{Error, FIELD_MANAGER, LABEL_OWNER_NAME, LABEL_OWNER_NAMESPACE};

/// Cadence for periodic re-reconciliation of a converged cache
const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Requeue delay after a reconcile error
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Context for the fan-out controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
}

/// Error policy for the fan-out controller.
///
/// Logs the error and requeues for retry.
pub fn error_policy(_obj: Arc<ImageCache>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, retryable = error.is_retryable(), "ImageCache reconcile error, will retry");
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/// Reconcile an ImageCache: fan out to per-node ImageWarms, then propagate
/// aggregate readiness back onto the cache.
pub async fn reconcile(cache: Arc<ImageCache>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cache.name_any();
    let namespace = cache
        .namespace()
        .ok_or_else(|| Error::internal("reconciler", "ImageCache must be namespaced"))?;

    if cache.metadata.deletion_timestamp.is_some() {
        info!(cache = %name, "ImageCache is being deleted, nothing to do");
        return Ok(Action::await_change());
    }

    info!(cache = %name, image = %cache.spec.image, "reconciling ImageCache");

    if let Err(e) = fan_out(&cache, &name, &namespace, &ctx.client).await {
        warn!(cache = %name, error = %e, "image warm fan-out failed");
        let mut status = cache.status.clone().unwrap_or_default();
        status.mark_ready_false("ReconcileFailed", format!("image warm fan-out failed: {}", e));
        // Best effort: the fan-out error is what gets retried, not this write
        if let Err(pe) =
            patch_resource_status::<ImageCache>(&ctx.client, &name, &namespace, &status, FIELD_MANAGER)
                .await
        {
            warn!(cache = %name, error = %pe, "failed to downgrade ImageCache status");
        }
        return Err(e);
    }

    propagate_ready_status(&cache, &name, &namespace, &ctx.client).await?;
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Walk every node and converge its ImageWarm for this cache.
///
/// Stops at the first failing node; re-running is safe because every
/// per-node operation is idempotent.
async fn fan_out(
    cache: &ImageCache,
    name: &str,
    namespace: &str,
    client: &Client,
) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node_list = nodes.list(&ListParams::default()).await?;

    for node in &node_list.items {
        let node_name = node.name_any();
        if node_eligible(node) {
            ensure_warm(cache, &node_name, namespace, client).await?;
        } else {
            ensure_warm_absent(name, &node_name, namespace, client).await?;
        }
    }
    Ok(())
}

/// Ensure the ImageWarm for (cache, node) exists with the desired labels,
/// annotations, and spec. Creates when absent; compares and merge-patches
/// when present; short-circuits when nothing differs.
async fn ensure_warm(
    cache: &ImageCache,
    node_name: &str,
    namespace: &str,
    client: &Client,
) -> Result<(), Error> {
    let warms: Api<ImageWarm> = Api::namespaced(client.clone(), namespace);
    let desired = build_image_warm(cache, node_name);
    let target = warm_name(&cache.name_any(), node_name);

    match warms.get_opt(&target).await? {
        None => {
            info!(warm = %target, node = %node_name, "creating ImageWarm");
            warms.create(&PostParams::default(), &desired).await?;
        }
        Some(current) => {
            if !warm_needs_update(&current, &desired) {
                return Ok(());
            }
            debug!(warm = %target, node = %node_name, "patching drifted ImageWarm");
            let patch = serde_json::json!({
                "metadata": {
                    "labels": desired.labels(),
                    "annotations": desired.annotations(),
                },
                "spec": desired.spec,
            });
            warms
                .patch(&target, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
    }
    Ok(())
}

/// Delete the ImageWarm for (cache, node) if it exists; not-found is success.
async fn ensure_warm_absent(
    cache_name: &str,
    node_name: &str,
    namespace: &str,
    client: &Client,
) -> Result<(), Error> {
    let warms: Api<ImageWarm> = Api::namespaced(client.clone(), namespace);
    let target = warm_name(cache_name, node_name);

    match warms.delete(&target, &DeleteParams::default()).await {
        Ok(_) => {
            info!(warm = %target, node = %node_name, "deleted ImageWarm for ineligible node");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// True when the observed ImageWarm drifted from the desired one in any
/// field the fan-out controller owns.
fn warm_needs_update(current: &ImageWarm, desired: &ImageWarm) -> bool {
    current.labels() != desired.labels()
        || current.annotations() != desired.annotations()
        || current.spec.image_pull_secrets != desired.spec.image_pull_secrets
        || current.spec.node_name != desired.spec.node_name
}

/// List the ImageWarms owned by this cache (via the owner labels) and roll
/// their readiness up: any non-ready warm marks the cache False with a
/// message naming the offending node; zero warms is vacuously ready.
async fn propagate_ready_status(
    cache: &ImageCache,
    name: &str,
    namespace: &str,
    client: &Client,
) -> Result<(), Error> {
    let warms: Api<ImageWarm> = Api::namespaced(client.clone(), namespace);
    let selector = format!(
        "{}={},{}={}",
        LABEL_OWNER_NAME, name, LABEL_OWNER_NAMESPACE, namespace
    );
    let warm_list = warms.list(&ListParams::default().labels(&selector)).await?;

    let mut status = cache.status.clone().unwrap_or_default();
    match first_not_ready(&warm_list.items) {
        Some(warm) => status.mark_ready_false(
            "ResourceNotReady",
            format!(
                "ImageWarm {} on node {} not ready",
                warm.name_any(),
                warm.spec.node_name
            ),
        ),
        None => status.mark_ready_true(),
    }
    status.observed_generation = cache.metadata.generation;

    // Skip the write when nothing changed; a status bump is a watch event
    // and an unconditional patch would re-trigger this reconcile forever.
    let current = serde_json::to_value(cache.status.clone().unwrap_or_default())
        .map_err(|e| Error::serialization(e.to_string()))?;
    let desired = serde_json::to_value(&status).map_err(|e| Error::serialization(e.to_string()))?;
    if current == desired {
        return Ok(());
    }

    patch_resource_status::<ImageCache>(client, name, namespace, &status, FIELD_MANAGER).await?;
    Ok(())
}

/// First warm that does not report Ready=True, if any
fn first_not_ready(warms: &[ImageWarm]) -> Option<&ImageWarm> {
    warms.iter().find(|w| !w.is_ready())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_common::crd::{ImageCacheSpec, ImageWarmSpec, ImageWarmStatus, LocalSecretReference};

    fn sample_cache(name: &str) -> ImageCache {
        let mut cache = ImageCache::new(
            name,
            ImageCacheSpec {
                image: "registry.example.com/team/app:v3".to_string(),
                image_pull_secrets: vec![],
            },
        );
        cache.metadata.namespace = Some("prod".to_string());
        cache.metadata.uid = Some("uid-1".to_string());
        cache
    }

    fn warm_on(node: &str, ready: Option<bool>) -> ImageWarm {
        let mut warm = ImageWarm::new(
            &warm_name("app", node),
            ImageWarmSpec {
                image: "registry.example.com/team/app:v3".to_string(),
                node_name: node.to_string(),
                image_pull_secrets: vec![],
            },
        );
        if let Some(ready) = ready {
            let mut status = ImageWarmStatus::default();
            if ready {
                status.mark_ready_true();
            } else {
                status.mark_pulling();
            }
            warm.status = Some(status);
        }
        warm
    }

    #[test]
    fn no_warms_is_vacuously_ready() {
        assert!(first_not_ready(&[]).is_none());
    }

    #[test]
    fn all_ready_warms_aggregate_to_ready() {
        let warms = vec![warm_on("node-a", Some(true)), warm_on("node-b", Some(true))];
        assert!(first_not_ready(&warms).is_none());
    }

    #[test]
    fn one_pending_warm_names_the_offending_node() {
        let warms = vec![
            warm_on("node-a", Some(true)),
            warm_on("node-b", Some(false)),
            warm_on("node-c", None),
        ];
        let offender = first_not_ready(&warms).unwrap();
        assert_eq!(offender.spec.node_name, "node-b");
    }

    #[test]
    fn warm_without_status_is_not_ready() {
        let warms = vec![warm_on("node-a", None)];
        assert_eq!(
            first_not_ready(&warms).unwrap().spec.node_name,
            "node-a"
        );
    }

    #[test]
    fn identical_warm_short_circuits_update() {
        let cache = sample_cache("app");
        let desired = build_image_warm(&cache, "node-a");
        let current = build_image_warm(&cache, "node-a");
        assert!(!warm_needs_update(&current, &desired));
    }

    #[test]
    fn changed_pull_secrets_require_update() {
        let cache = sample_cache("app");
        let desired = build_image_warm(&cache, "node-a");
        let mut current = build_image_warm(&cache, "node-a");
        current.spec.image_pull_secrets = vec![LocalSecretReference::new("stale")];
        assert!(warm_needs_update(&current, &desired));
    }

    #[test]
    fn changed_labels_require_update() {
        let mut cache = sample_cache("app");
        let current = build_image_warm(&cache, "node-a");
        cache
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "storage".to_string());
        let desired = build_image_warm(&cache, "node-a");
        assert!(warm_needs_update(&current, &desired));
    }

    #[test]
    fn warm_status_changes_do_not_require_update() {
        // The warmer owns status; a readiness flip alone must not trigger
        // a spec patch from the fan-out side.
        let cache = sample_cache("app");
        let desired = build_image_warm(&cache, "node-a");
        let mut current = build_image_warm(&cache, "node-a");
        let mut status = ImageWarmStatus::default();
        status.mark_ready_true();
        current.status = Some(status);
        assert!(!warm_needs_update(&current, &desired));
    }
}
