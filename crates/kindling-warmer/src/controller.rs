//! ImageWarm reconciliation on the node
//!
//! One pass over an ImageWarm targeted at this node:
//! - deletion → cancel any in-flight pull for the image (finalizer cleanup)
//! - image already present → mark Ready=True
//! - otherwise resolve the pull secret, submit the pull (non-blocking),
//!   mark Ready=Unknown/Pulling, and requeue to re-check existence
//!
//! Status writes are skipped when the observed condition already matches,
//! so repeated reconciles after readiness are no-ops.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event};
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use kindling_common::crd::{ConditionStatus, ImageWarm};
use kindling_common::kube_utils::patch_resource_status;
use kindling_common::{Error, FIELD_MANAGER, WARM_FINALIZER};

use crate::puller::SerialImagePuller;

/// Requeue cadence while a pull is in flight; the next pass flips the
/// condition to True once the image shows up in the runtime
const PULLING_REQUEUE: Duration = Duration::from_secs(15);

/// Requeue cadence once the image is present
const READY_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue delay after a reconcile error
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Context for the node warm reconciler
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// The node's pull pipeline
    pub puller: Arc<SerialImagePuller>,
    /// Pull secret name used when an ImageWarm references none
    pub default_pull_secret: String,
}

/// Error policy for the warm reconciler.
///
/// Logs the error and requeues for retry.
pub fn error_policy(_obj: Arc<ImageWarm>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, retryable = error.is_retryable(), "ImageWarm reconcile error, will retry");
    Action::requeue(ERROR_REQUEUE)
}

/// Reconcile an ImageWarm through the finalizer helper so deletion runs
/// the cleanup path before the object is released.
pub async fn reconcile(warm: Arc<ImageWarm>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = warm
        .namespace()
        .ok_or_else(|| Error::internal("warmer", "ImageWarm must be namespaced"))?;
    let warms: Api<ImageWarm> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&warms, WARM_FINALIZER, warm, |event| async {
        match event {
            Event::Apply(warm) => apply(warm, &namespace, &ctx).await,
            Event::Cleanup(warm) => cleanup(warm, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        FinalizerError::ApplyFailed(err) | FinalizerError::CleanupFailed(err) => err,
        FinalizerError::AddFinalizer(source) | FinalizerError::RemoveFinalizer(source) => {
            source.into()
        }
        other => Error::internal("finalizer", other.to_string()),
    })
}

/// Converge a live ImageWarm: check existence, pull when absent.
async fn apply(warm: Arc<ImageWarm>, namespace: &str, ctx: &Context) -> Result<Action, Error> {
    let name = warm.name_any();
    let image = warm.spec.image.as_str();
    info!(warm = %name, image = %image, "reconciling ImageWarm");

    match ctx.puller.exists(image).await {
        Ok(true) => {
            if !warm.is_ready() {
                info!(warm = %name, image = %image, "image present on node, marking ready");
                let mut status = warm.status.clone().unwrap_or_default();
                status.mark_ready_true();
                patch_resource_status::<ImageWarm>(
                    &ctx.client,
                    &name,
                    namespace,
                    &status,
                    FIELD_MANAGER,
                )
                .await?;
            }
            return Ok(Action::requeue(READY_REQUEUE));
        }
        Ok(false) => {}
        // A flaky runtime list must not wedge the warm; the pull path
        // surfaces real runtime errors
        Err(e) => {
            warn!(warm = %name, image = %image, error = %e, "existence check failed, proceeding as if absent")
        }
    }

    let secret = resolve_pull_secret(&warm, namespace, ctx).await;
    ctx.puller.submit(image, secret).await;

    if !marked_pulling(&warm) {
        let mut status = warm.status.clone().unwrap_or_default();
        status.mark_pulling();
        patch_resource_status::<ImageWarm>(&ctx.client, &name, namespace, &status, FIELD_MANAGER)
            .await?;
    }
    Ok(Action::requeue(PULLING_REQUEUE))
}

/// Finalizer cleanup: cancel any in-flight pull for the image.
///
/// Best-effort by design — cancelling when nothing is in flight is a
/// no-op, and deletion always proceeds.
async fn cleanup(warm: Arc<ImageWarm>, ctx: &Context) -> Result<Action, Error> {
    info!(
        warm = %warm.name_any(),
        image = %warm.spec.image,
        "ImageWarm deleted, cancelling any in-flight pull"
    );
    ctx.puller.cancel(&warm.spec.image);
    Ok(Action::await_change())
}

/// Pick the pull secret name: first referenced secret, else the default
fn pull_secret_name(warm: &ImageWarm, default: &str) -> String {
    warm.spec
        .image_pull_secrets
        .first()
        .map(|secret_ref| secret_ref.name.clone())
        .unwrap_or_else(|| default.to_string())
}

/// True when the warm is already marked Unknown (pull submitted)
fn marked_pulling(warm: &ImageWarm) -> bool {
    warm.status
        .as_ref()
        .and_then(|s| s.ready_status())
        .map(|status| *status == ConditionStatus::Unknown)
        .unwrap_or(false)
}

/// Fetch the resolved pull secret. Lookup failure (including not-found)
/// degrades to an anonymous pull — public images still warm without
/// credentials.
async fn resolve_pull_secret(warm: &ImageWarm, namespace: &str, ctx: &Context) -> Option<Secret> {
    let secret_name = pull_secret_name(warm, &ctx.default_pull_secret);
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    match secrets.get_opt(&secret_name).await {
        Ok(Some(secret)) => Some(secret),
        Ok(None) => {
            warn!(secret = %secret_name, "pull secret not found, pulling anonymously");
            None
        }
        Err(e) => {
            warn!(secret = %secret_name, error = %e, "pull secret lookup failed, pulling anonymously");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_common::crd::{ImageWarmSpec, ImageWarmStatus, LocalSecretReference};

    fn sample_warm(secrets: Vec<LocalSecretReference>) -> ImageWarm {
        ImageWarm::new(
            "app-on-node-a",
            ImageWarmSpec {
                image: "quay.io/team/app:v1".to_string(),
                node_name: "node-a".to_string(),
                image_pull_secrets: secrets,
            },
        )
    }

    #[test]
    fn first_referenced_secret_wins() {
        let warm = sample_warm(vec![
            LocalSecretReference::new("primary"),
            LocalSecretReference::new("secondary"),
        ]);
        assert_eq!(pull_secret_name(&warm, "pullsecret"), "primary");
    }

    #[test]
    fn default_secret_used_when_none_referenced() {
        let warm = sample_warm(vec![]);
        assert_eq!(pull_secret_name(&warm, "pullsecret"), "pullsecret");
    }

    #[test]
    fn marked_pulling_tracks_unknown_condition() {
        let mut warm = sample_warm(vec![]);
        assert!(!marked_pulling(&warm));

        let mut status = ImageWarmStatus::default();
        status.mark_pulling();
        warm.status = Some(status);
        assert!(marked_pulling(&warm));

        let mut status = ImageWarmStatus::default();
        status.mark_ready_true();
        warm.status = Some(status);
        assert!(!marked_pulling(&warm));
    }
}
