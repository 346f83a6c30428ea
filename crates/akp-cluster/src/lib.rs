//! Lifecycle reconciler for remotely-hosted clusters
//!
//! Creates, reads, updates and deletes cluster records in the backend, waits
//! for the backend's asynchronous reconciliation, and installs or removes
//! the cluster's agent by applying its manifest bundle to the target
//! Kubernetes cluster.
//!
//! Related crates:
//! - `akp-common`: errors, tri-state values, manifest parsing and kube utilities

pub mod access;
pub mod api;
pub mod config;
pub mod diagnostics;
pub mod document;
pub mod manifests;
pub mod merge;
pub mod reconciler;
pub mod status;
pub mod types;

pub use access::KubeConnector;
pub use api::{ClusterApi, ClusterRecord, CreateClusterRequest, UpdateClusterRequest};
pub use config::ReconcilerConfig;
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use manifests::{ClusterConnector, ManifestEngine, ResourceApplier};
pub use merge::{merge_documents, Merge};
pub use reconciler::{ClusterReconciler, ReadOutcome, Reconciled};
pub use status::{StatusDimension, StatusPoller};
pub use types::{
    ClusterCredentials, ClusterDesiredState, ClusterObservedState, ClusterSize, ClusterState,
};

// Re-export common types
pub use akp_common::{Error, Result, Tristate};
