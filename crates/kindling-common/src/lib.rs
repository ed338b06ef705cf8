//! Common types for Kindling: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod node;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for the Kindling CRDs
pub const GROUP: &str = "kindling.dev";

/// Label key carrying the target node name on an ImageWarm
pub const LABEL_NODE_NAME: &str = "kindling.dev/nodeName";

/// Label key carrying the owning ImageCache name on an ImageWarm
pub const LABEL_OWNER_NAME: &str = "kindling.dev/ownerRefName";

/// Label key carrying the owning ImageCache namespace on an ImageWarm
pub const LABEL_OWNER_NAMESPACE: &str = "kindling.dev/ownerRefNamespace";

/// Well-known pull-secret name used when an ImageWarm references none
pub const DEFAULT_PULL_SECRET: &str = "pullsecret";

/// Field manager for server-side apply and status patches
pub const FIELD_MANAGER: &str = "kindling";

/// Finalizer placed on ImageWarms by the node warmer so in-flight pulls
/// are cancelled before the object is released
pub const WARM_FINALIZER: &str = "kindling.dev/warmer";
