//! Common types for the AKP cluster reconciler: errors, tri-state values,
//! manifest parsing and Kubernetes utilities

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod telemetry;
pub mod tristate;
pub mod yaml;

pub use error::Error;
pub use tristate::Tristate;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on objects created or replaced by the reconciler
pub const DEFAULT_FIELD_MANAGER: &str = "akp-cluster-reconciler";
