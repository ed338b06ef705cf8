//! Pull progress monitoring
//!
//! One monitor per in-flight pull. The pull path records every progress
//! event; a watchdog task ticks on a fixed interval and force-cancels the
//! pull when no progress arrived within the stall deadline. This bounds a
//! hung pull (registry unresponsive, 0 bytes/sec) in wall-clock time
//! instead of blocking the single pull worker forever.
//!
//! Cancellation flows through the pull's `CancellationToken` only; there
//! is no separate kill path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cri::PullProgress;

/// Interval between watchdog ticks (and progress log lines)
pub const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Default stall deadline. The runtime reports progress every few hundred
/// kilobytes, so a healthy pull never comes close to this.
pub const DEFAULT_PROGRESS_DEADLINE: Duration = Duration::from_secs(300);

struct ProgressCell {
    message: String,
    updated_at: Instant,
}

/// Latest progress of one in-flight pull, plus the stall watchdog state
pub struct ProgressMonitor {
    image: String,
    cell: RwLock<ProgressCell>,
    /// The pull's cancellation handle; cancelling it is the only abort path
    cancel: CancellationToken,
    /// Explicit stop signal set when the pull finishes or errors
    stop: CancellationToken,
    stalled: AtomicBool,
    deadline: Duration,
}

impl ProgressMonitor {
    /// Create a monitor for `image` wired to the pull's cancellation token
    pub fn new(
        image: impl Into<String>,
        cancel: CancellationToken,
        deadline: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            image: image.into(),
            cell: RwLock::new(ProgressCell {
                message: "no progress".to_string(),
                updated_at: Instant::now(),
            }),
            cancel,
            stop: CancellationToken::new(),
            stalled: AtomicBool::new(false),
            deadline,
        })
    }

    /// Record a progress event, resetting the stall deadline
    pub fn update(&self, event: &PullProgress) {
        let mut cell = self.cell.write().unwrap_or_else(|e| e.into_inner());
        cell.message = event.render();
        cell.updated_at = Instant::now();
    }

    /// True when the watchdog force-cancelled the pull for lack of progress
    pub fn stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Signal that the pull finished or errored; the watchdog cancels
    /// (a no-op on an already-finished pull) and exits
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Spawn the watchdog task
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    fn snapshot(&self) -> (String, Instant) {
        let cell = self.cell.read().unwrap_or_else(|e| e.into_inner());
        (cell.message.clone(), cell.updated_at)
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(PROGRESS_REPORT_INTERVAL);
        // The first tick completes immediately; swallow it so the first
        // stall check happens a full interval in
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (message, updated_at) = self.snapshot();
                    if updated_at.elapsed() > self.deadline {
                        warn!(
                            image = %self.image,
                            deadline = ?self.deadline,
                            progress = %message,
                            "cancelling pull: no progress within deadline"
                        );
                        self.stalled.store(true, Ordering::SeqCst);
                        self.cancel.cancel();
                        return;
                    }
                    info!(image = %self.image, progress = %message, "pulling image");
                }
                _ = self.stop.cancelled() => {
                    let (message, _) = self.snapshot();
                    self.cancel.cancel();
                    debug!(image = %self.image, progress = %message, "pull complete");
                    return;
                }
            }
        }
    }
}
