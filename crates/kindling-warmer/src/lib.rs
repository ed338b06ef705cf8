//! Kindling warmer - per-node image pull daemon
//!
//! Runs once per node, watching only the ImageWarms labeled for its own
//! node name. For each warm it decides whether a pull is needed and drives
//! it through a serial, deduplicating, stall-bounded pull pipeline:
//!
//! - `controller` — ImageWarm reconcile and finalize
//! - `puller` — single-worker pull pipeline with in-flight coalescing
//! - `pull` — one pull execution: credential candidates, progress stream
//! - `progress` — stall watchdog for an in-flight pull
//! - `cri` — the container runtime surface (trait + Docker Engine client)
//! - `creds` — registry credential resolution from pull secrets

pub mod controller;
pub mod creds;
pub mod cri;
pub mod progress;
pub mod pull;
pub mod puller;

pub use controller::{error_policy, reconcile, Context};
pub use puller::SerialImagePuller;
