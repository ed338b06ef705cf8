//! One pull execution
//!
//! Resolves credential candidates for the image's registry, initiates the
//! pull (trying each candidate in order, anonymously when there are none),
//! then consumes the runtime's progress stream under the stall watchdog.
//!
//! In-stream failures are terminal — once a pull is streaming, a later
//! error does not fall back to the next credential.

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kindling_common::{Error, Result};

use crate::creds::{registry_auths, RegistryAuth};
use crate::cri::{parse_registry, ImageService, ProgressStream};
use crate::progress::ProgressMonitor;

/// Pull `image_ref` to completion, honoring `cancel` and the stall
/// deadline.
pub async fn pull_image(
    service: &dyn ImageService,
    image_ref: &str,
    secret: Option<&Secret>,
    deadline: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let registry = parse_registry(image_ref);
    let candidates = match secret {
        Some(secret) => registry_auths(secret, registry)?,
        None => Vec::new(),
    };

    let stream = if candidates.is_empty() {
        debug!(image = %image_ref, "pulling anonymously");
        service.pull(image_ref, None).await?
    } else {
        initiate_with_candidates(service, image_ref, candidates).await?
    };

    drive_pull(stream, image_ref, deadline, cancel).await
}

/// Try each credential candidate in order until one initiates a pull;
/// if all fail, aggregate every failure into one error.
async fn initiate_with_candidates(
    service: &dyn ImageService,
    image_ref: &str,
    candidates: Vec<RegistryAuth>,
) -> Result<ProgressStream> {
    let mut failures = Vec::new();
    for auth in candidates {
        let username = auth.username.clone();
        info!(image = %image_ref, user = %username, "attempting authenticated pull");
        match service.pull(image_ref, Some(auth)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(image = %image_ref, user = %username, error = %e, "pull attempt failed");
                failures.push(format!("user {}: {}", username, e));
            }
        }
    }
    Err(Error::pull(image_ref, failures))
}

/// Consume the progress stream until the pull completes, errors, or is
/// cancelled. The watchdog cancels the same token on stall, which is how
/// a stalled pull is told apart from an externally cancelled one.
async fn drive_pull(
    mut stream: ProgressStream,
    image_ref: &str,
    deadline: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let monitor = ProgressMonitor::new(image_ref, cancel.clone(), deadline);
    let watchdog = monitor.start();

    let result = loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(Ok(progress)) => monitor.update(&progress),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
            _ = cancel.cancelled() => {
                break if monitor.stalled() {
                    Err(Error::stall(image_ref, deadline))
                } else {
                    Err(Error::internal(
                        "puller",
                        format!("pull of {} cancelled", image_ref),
                    ))
                };
            }
        }
    };

    monitor.stop();
    let _ = watchdog.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::{MockImageService, PullProgress};
    use futures::stream;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const DEADLINE: Duration = Duration::from_secs(30);

    fn finished_stream(events: Vec<PullProgress>) -> ProgressStream {
        Box::pin(stream::iter(events.into_iter().map(Ok)))
    }

    fn docker_secret(registry: &str, username: &str) -> Secret {
        let payload = serde_json::json!({
            "auths": { registry: {"username": username, "password": "pw"} }
        });
        let mut data = BTreeMap::new();
        data.insert(
            ".dockerconfigjson".to_string(),
            k8s_openapi::ByteString(payload.to_string().into_bytes()),
        );
        Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("regcred".to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    // Two candidates for quay.io; entries iterate in key order, so alice
    // (under the https:// key) is tried before bob.
    fn two_user_secret() -> Secret {
        let payload = serde_json::json!({
            "auths": {
                "https://quay.io/v2/": {"username": "alice", "password": "a"},
                "quay.io": {"username": "bob", "password": "b"}
            }
        });
        let mut data = BTreeMap::new();
        data.insert(
            ".dockerconfigjson".to_string(),
            k8s_openapi::ByteString(payload.to_string().into_bytes()),
        );
        Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("regcred".to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn anonymous_pull_when_no_secret() {
        let mut mock = MockImageService::new();
        mock.expect_pull()
            .withf(|image, auth| image == "quay.io/team/app:v1" && auth.is_none())
            .returning(|_, _| Ok(finished_stream(vec![])));

        let result = pull_image(
            &mock,
            "quay.io/team/app:v1",
            None,
            DEADLINE,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn anonymous_pull_when_secret_has_no_matching_registry() {
        let mut mock = MockImageService::new();
        mock.expect_pull()
            .withf(|_, auth| auth.is_none())
            .returning(|_, _| Ok(finished_stream(vec![])));

        let secret = docker_secret("gcr.io", "alice");
        let result = pull_image(
            &mock,
            "quay.io/team/app:v1",
            Some(&secret),
            DEADLINE,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn credential_candidates_are_tried_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut mock = MockImageService::new();
        mock.expect_pull().returning(move |_, auth| {
            let auth = auth.expect("authenticated attempt expected");
            match seen.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    assert_eq!(auth.username, "alice");
                    Err(Error::runtime("pull", "401 unauthorized"))
                }
                _ => {
                    assert_eq!(auth.username, "bob");
                    Ok(finished_stream(vec![]))
                }
            }
        });

        let secret = two_user_secret();
        let result = pull_image(
            &mock,
            "quay.io/team/app:v1",
            Some(&secret),
            DEADLINE,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn all_candidates_failing_aggregates_every_attempt() {
        let mut mock = MockImageService::new();
        mock.expect_pull()
            .returning(|_, _| Err(Error::runtime("pull", "401 unauthorized")));

        let secret = two_user_secret();
        let err = pull_image(
            &mock,
            "quay.io/team/app:v1",
            Some(&secret),
            DEADLINE,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("alice"), "missing first attempt: {}", msg);
        assert!(msg.contains("bob"), "missing second attempt: {}", msg);
        assert!(matches!(err, Error::Pull { .. }));
    }

    #[tokio::test]
    async fn in_stream_error_is_terminal() {
        let mut mock = MockImageService::new();
        mock.expect_pull().times(1).returning(|_, _| {
            Ok(Box::pin(stream::iter(vec![
                Ok(PullProgress {
                    id: None,
                    status: "Downloading".to_string(),
                    detail: None,
                }),
                Err(Error::runtime("pull", "manifest unknown")),
            ])))
        });

        let secret = docker_secret("quay.io", "alice");
        let err = pull_image(
            &mock,
            "quay.io/team/app:v1",
            Some(&secret),
            DEADLINE,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("manifest unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_pull_surfaces_a_stall_error() {
        let mut mock = MockImageService::new();
        mock.expect_pull()
            .returning(|_, _| Ok(Box::pin(stream::pending())));

        let err = pull_image(
            &mock,
            "quay.io/team/app:v1",
            None,
            DEADLINE,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Stall { .. }), "got: {}", err);
    }

    #[tokio::test]
    async fn external_cancel_is_not_reported_as_stall() {
        let mut mock = MockImageService::new();
        mock.expect_pull()
            .returning(|_, _| Ok(Box::pin(stream::pending())));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pull_image(&mock, "quay.io/team/app:v1", None, DEADLINE, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }), "got: {}", err);
    }
}
