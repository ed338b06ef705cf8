//! ImageCache fan-out controller for Kindling
//!
//! Watches ImageCache CRDs and keeps one ImageWarm per eligible node alive
//! for each of them:
//! - expands an ImageCache into `<cache>-on-<node>` ImageWarms
//! - deletes ImageWarms for nodes that became ineligible
//! - aggregates per-node readiness back onto the ImageCache
//!
//! Node topology is watched live: a node joining, leaving, or flipping
//! schedulability re-enqueues every known ImageCache.

pub mod controller;
pub mod node_watch;

pub use controller::{error_policy, reconcile, Context};
pub use node_watch::{node_trigger, NodeEligibilityTracker};
