//! Kindling custom resource definitions
//!
//! Two CRDs drive the system: [`ImageCache`] is the cluster operator's
//! desired state ("keep this image warm everywhere"), and [`ImageWarm`] is
//! the per-node expansion of it, consumed by the node warmer daemon.

mod image_cache;
mod image_warm;
mod types;

pub use image_cache::{ImageCache, ImageCacheSpec, ImageCacheStatus};
pub use image_warm::{build_image_warm, warm_name, ImageWarm, ImageWarmSpec, ImageWarmStatus};
pub use types::{Condition, ConditionStatus, LocalSecretReference, CONDITION_READY};
