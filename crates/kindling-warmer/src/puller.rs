//! Serial image pull pipeline
//!
//! A bounded request channel feeds exactly one worker task, so at most one
//! pull is in flight on the node at any time — a deliberate trade of
//! throughput for bounded disk and network contention. Duplicate
//! submissions for an image already in flight coalesce into the existing
//! request instead of queueing twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kindling_common::Result;

use crate::cri::{parse_repository_tag, strip_default_registry, ImageService};
use crate::pull::pull_image;

/// Maximum number of queued pull requests; submitters wait once full
const MAX_QUEUED_PULLS: usize = 10;

/// One registered pull, keyed by image reference in the in-flight map
struct PullRequest {
    image: String,
    secret: Option<Secret>,
    cancel: CancellationToken,
    finished: AtomicBool,
}

impl PullRequest {
    fn new(image: &str, secret: Option<Secret>) -> Self {
        Self {
            image: image.to_string(),
            secret,
            cancel: CancellationToken::new(),
            finished: AtomicBool::new(false),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// In-flight request registry.
///
/// The lock never leaks to callers; all access goes through get/put/remove.
/// Readers do not block each other.
#[derive(Default)]
struct InFlight {
    map: RwLock<HashMap<String, Arc<PullRequest>>>,
}

impl InFlight {
    fn get(&self, image: &str) -> Option<Arc<PullRequest>> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.get(image).cloned()
    }

    fn put(&self, request: Arc<PullRequest>) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.insert(request.image.clone(), request);
    }

    fn remove(&self, image: &str) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.remove(image);
    }
}

/// Single-worker pull pipeline with in-flight deduplication
pub struct SerialImagePuller {
    service: Arc<dyn ImageService>,
    tx: mpsc::Sender<Arc<PullRequest>>,
    in_flight: Arc<InFlight>,
}

impl SerialImagePuller {
    /// Create the puller and spawn its single worker task
    pub fn new(service: Arc<dyn ImageService>, progress_deadline: Duration) -> Self {
        let (tx, rx) = mpsc::channel(MAX_QUEUED_PULLS);
        let in_flight = Arc::new(InFlight::default());
        tokio::spawn(run_worker(
            rx,
            Arc::clone(&in_flight),
            Arc::clone(&service),
            progress_deadline,
        ));
        Self {
            service,
            tx,
            in_flight,
        }
    }

    /// Queue a pull for `image_ref`. A no-op when an unfinished request for
    /// the same reference is already registered — duplicate reconciles must
    /// not duplicate pulls.
    pub async fn submit(&self, image_ref: &str, secret: Option<Secret>) {
        if let Some(existing) = self.in_flight.get(image_ref) {
            if !existing.is_finished() {
                debug!(image = %image_ref, "pull already in flight, coalescing");
                return;
            }
        }

        info!(image = %image_ref, "queueing image pull");
        let request = Arc::new(PullRequest::new(image_ref, secret));
        self.in_flight.put(Arc::clone(&request));
        if self.tx.send(request).await.is_err() {
            warn!(image = %image_ref, "pull worker is gone, dropping request");
            self.in_flight.remove(image_ref);
        }
    }

    /// Cancel the in-flight pull for `image_ref`, if any, and deregister
    /// it. A no-op when nothing is registered.
    pub fn cancel(&self, image_ref: &str) {
        if let Some(request) = self.in_flight.get(image_ref) {
            if !request.is_finished() {
                info!(image = %request.image, "cancelling in-flight pull");
                request.cancel.cancel();
            }
            self.in_flight.remove(image_ref);
        }
    }

    /// Whether the runtime already has the image
    pub async fn exists(&self, image_ref: &str) -> Result<bool> {
        image_exists(self.service.as_ref(), image_ref).await
    }
}

/// Existence check against the runtime's image list.
///
/// Digest-qualified references match on repo digests only; everything else
/// matches on (repository, tag) parsed the same way on both sides.
async fn image_exists(service: &dyn ImageService, image_ref: &str) -> Result<bool> {
    let normalized = strip_default_registry(image_ref);
    let images = service.list().await?;

    if normalized.contains("@sha256:") {
        Ok(images.iter().any(|info| info.contains_digest(normalized)))
    } else {
        let (name, tag) = parse_repository_tag(normalized);
        Ok(images.iter().any(|info| info.contains_image(name, tag)))
    }
}

/// The single worker: one request at a time, in arrival order.
async fn run_worker(
    mut rx: mpsc::Receiver<Arc<PullRequest>>,
    in_flight: Arc<InFlight>,
    service: Arc<dyn ImageService>,
    progress_deadline: Duration,
) {
    while let Some(request) = rx.recv().await {
        debug!(image = %request.image, "pull worker picked up request");

        // Another process may have pulled the image while the request sat
        // in the queue
        let present = match image_exists(service.as_ref(), &request.image).await {
            Ok(present) => present,
            Err(e) => {
                warn!(image = %request.image, error = %e, "existence re-check failed, attempting pull");
                false
            }
        };

        if present {
            debug!(image = %request.image, "image already present, skipping pull");
        } else {
            match pull_image(
                service.as_ref(),
                &request.image,
                request.secret.as_ref(),
                progress_deadline,
                request.cancel.clone(),
            )
            .await
            {
                Ok(()) => info!(image = %request.image, "image pull complete"),
                // Retry is the owning reconcile loop's job, not the worker's
                Err(e) => warn!(image = %request.image, error = %e, "image pull failed"),
            }
        }

        request.finish();
        in_flight.remove(&request.image);
    }
}
