//! Error types for the Kindling controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information like image references,
//! secret names, and underlying causes, and knows whether a retry can
//! help (`is_retryable`).

use thiserror::Error;

/// Main error type for Kindling operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid or missing process configuration
    ///
    /// Raised once at startup (e.g. missing node identity); the process
    /// must not start without it.
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's missing or invalid
        message: String,
    },

    /// Pull-secret credential resolution error
    #[error("credential error for secret {secret}: {message}")]
    Credential {
        /// Name of the secret being decoded
        secret: String,
        /// Description of what failed
        message: String,
    },

    /// Image pull failure, aggregated across credential attempts
    #[error("failed to pull image {image}: {}", .failures.join("; "))]
    Pull {
        /// The image reference that failed to pull
        image: String,
        /// One entry per failed attempt, in the order they were tried
        failures: Vec<String>,
    },

    /// A pull showed no progress past the stall deadline and was cancelled
    ///
    /// Distinct from [`Error::Pull`] so operators can tell a slow or dead
    /// network from bad credentials or a bad image reference.
    #[error("pull of image {image} stalled: no progress for {deadline_secs}s")]
    Stall {
        /// The image reference whose pull stalled
        image: String,
        /// The stall deadline that was exceeded, in seconds
        deadline_secs: u64,
    },

    /// Container runtime operation error
    #[error("runtime error during {operation}: {message}")]
    Runtime {
        /// The runtime operation that failed (pull, list, remove)
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g., "reconciler", "puller")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a credential error for a specific secret
    pub fn credential(secret: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            secret: secret.into(),
            message: msg.into(),
        }
    }

    /// Create a pull error from the failures of every attempted credential
    pub fn pull(image: impl Into<String>, failures: Vec<String>) -> Self {
        Self::Pull {
            image: image.into(),
            failures,
        }
    }

    /// Create a stall error for an image pull
    pub fn stall(image: impl Into<String>, deadline: std::time::Duration) -> Self {
        Self::Stall {
            image: image.into(),
            deadline_secs: deadline.as_secs(),
        }
    }

    /// Create a runtime error for a specific operation
    pub fn runtime(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runtime {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration errors are not retryable (the process must be fixed
    /// and restarted). Kubernetes errors depend on the status code. Pull,
    /// stall, and runtime errors are retried by the next reconcile.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout, conflict)
                // but not on other 4xx errors (validation, forbidden, etc.)
                match source {
                    kube::Error::Api(ae) => ae.code == 409 || !(400..500).contains(&ae.code),
                    _ => true,
                }
            }
            Error::Config { .. } => false,
            Error::Credential { .. } => true,
            Error::Pull { .. } => true,
            Error::Stall { .. } => true,
            Error::Runtime { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
