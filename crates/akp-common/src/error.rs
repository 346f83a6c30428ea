//! Error types for the AKP cluster reconciler
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context a caller needs to decide whether the
//! failure is fatal to the whole operation or only to its manifest step.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cluster lifecycle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error from the cluster-access layer
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Network or authentication failure talking to the remote cluster API
    #[error("transport error during {operation}: {message}")]
    Transport {
        /// Remote call that failed (e.g., "create_cluster", "get_manifests")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Remote record does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of record that was looked up (e.g., "cluster")
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// A manifest document could not be decoded into a resource descriptor
    #[error("malformed manifest (document {document}): {message}")]
    MalformedManifest {
        /// Zero-based index of the offending document in the bundle
        document: usize,
        /// Description of what's invalid
        message: String,
    },

    /// A resource could not be created or replaced in the target cluster
    #[error("failed to apply {resource} ({completed} applied before it): {message}")]
    ApplyFailed {
        /// The resource that failed (e.g., "Deployment akuity/akuity-agent")
        resource: String,
        /// Number of resources applied successfully before the failure
        completed: usize,
        /// Underlying cause
        message: String,
    },

    /// A resource could not be removed from the target cluster
    #[error("failed to delete {resource} ({completed} deleted before it): {message}")]
    DeleteFailed {
        /// The resource that failed
        resource: String,
        /// Number of resources deleted successfully before the failure
        completed: usize,
        /// Underlying cause
        message: String,
    },

    /// Cluster-access credentials missing or unusable
    #[error("cluster access configuration error: {message}")]
    Config {
        /// Description of what's missing or invalid
        message: String,
    },

    /// Desired or observed state could not be converted to/from its external form
    #[error("conversion error at {field}: {message}")]
    Conversion {
        /// Path of the field that failed to convert (e.g., "repo_server_delegate.managed_cluster")
        field: String,
        /// Description of what failed
        message: String,
    },

    /// The caller's cancellation token fired before the operation finished
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that observed the cancellation
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "delete_resource", "poll_until")
        context: String,
    },
}

impl Error {
    /// Create a transport error for a remote call
    pub fn transport(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a cluster identifier
    pub fn cluster_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "cluster".to_string(),
            id: id.into(),
        }
    }

    /// Create a not-found error for an arbitrary record kind
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a malformed-manifest error for the given document index
    pub fn malformed_manifest(document: usize, msg: impl Into<String>) -> Self {
        Self::MalformedManifest {
            document,
            message: msg.into(),
        }
    }

    /// Create an apply failure for a resource
    pub fn apply_failed(
        resource: impl Into<String>,
        completed: usize,
        msg: impl Into<String>,
    ) -> Self {
        Self::ApplyFailed {
            resource: resource.into(),
            completed,
            message: msg.into(),
        }
    }

    /// Create a delete failure for a resource
    pub fn delete_failed(
        resource: impl Into<String>,
        completed: usize,
        msg: impl Into<String>,
    ) -> Self {
        Self::DeleteFailed {
            resource: resource.into(),
            completed,
            message: msg.into(),
        }
    }

    /// Create a cluster-access configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a conversion error for a field path
    pub fn conversion(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conversion {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for an operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check whether this error means the target does not exist
    ///
    /// Covers remote records as well as Kubernetes objects answering 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } => crate::kube_utils::is_not_found(source),
            _ => false,
        }
    }

    /// Check if this error is retryable by the caller
    ///
    /// Nothing in this crate retries; the flag tells the caller's own control
    /// loop whether trying again could help. Malformed input, configuration
    /// and conversion problems need a fix first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, conflict)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Transport { .. } => true,
            Error::NotFound { .. } => false,
            Error::MalformedManifest { .. } => false,
            Error::ApplyFailed { .. } => true,
            Error::DeleteFailed { .. } => true,
            Error::Config { .. } => false,
            Error::Conversion { .. } => false,
            Error::Cancelled { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Number of resources completed before a manifest step failed
    pub fn completed(&self) -> Option<usize> {
        match self {
            Error::ApplyFailed { completed, .. } | Error::DeleteFailed { completed, .. } => {
                Some(*completed)
            }
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Transport { operation, .. } => Some(operation),
            _ => None,
        }
    }
}
