//! Agent manifest engine
//!
//! Applies a parsed bundle front to back and deletes it back to front. Both
//! directions stop at the first failing resource and report how many
//! resources were handled before it. Nothing is rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use akp_common::kube_utils::{parse_manifests, DeleteOptions, ManifestResource};
use akp_common::{Error, Result};

use crate::status::with_cancellation;
use crate::types::ClusterCredentials;

#[cfg(test)]
use mockall::automock;

/// Delete options used when tearing down an agent install
pub const TEARDOWN_DELETE_OPTIONS: DeleteOptions = DeleteOptions {
    ignore_not_found: true,
    wait_for_deletion: true,
    force: false,
};

/// Applies single resources to a target cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Create the resource if absent, else replace it.
    ///
    /// Returns a kubectl-style message (e.g., "deployment.apps/agent created").
    async fn apply(&self, resource: &ManifestResource) -> Result<String>;

    /// Delete the resource according to `options`
    async fn delete(&self, resource: &ManifestResource, options: &DeleteOptions) -> Result<String>;
}

/// Builds an applier from cluster credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the cluster described by `credentials`.
    ///
    /// Missing or unusable credentials yield [`Error::Config`].
    async fn connect(&self, credentials: &ClusterCredentials) -> Result<Arc<dyn ResourceApplier>>;
}

/// Parse a manifest bundle into resources in bundle order
pub fn parse(text: &str) -> Result<Vec<ManifestResource>> {
    parse_manifests(text)
}

/// Walks a bundle against one target cluster
pub struct ManifestEngine {
    applier: Arc<dyn ResourceApplier>,
}

impl ManifestEngine {
    /// Create an engine over an applier
    pub fn new(applier: Arc<dyn ResourceApplier>) -> Self {
        Self { applier }
    }

    /// Apply every resource in order; returns the number applied
    pub async fn apply_all(
        &self,
        resources: &[ManifestResource],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        info!(count = resources.len(), "applying manifests");

        for (completed, resource) in resources.iter().enumerate() {
            match with_cancellation(cancel, "apply_manifests", self.applier.apply(resource)).await
            {
                Ok(message) => debug!(resource = %resource.reference, %message, "applied"),
                Err(e @ Error::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    return Err(Error::apply_failed(
                        resource.reference.to_string(),
                        completed,
                        e.to_string(),
                    ))
                }
            }
        }

        Ok(resources.len())
    }

    /// Delete every resource in reverse order; returns the number deleted.
    ///
    /// A not-found failure counts as deleted when `options.ignore_not_found`
    /// is set.
    pub async fn delete_all(
        &self,
        resources: &[ManifestResource],
        options: &DeleteOptions,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        info!(count = resources.len(), "deleting manifests");

        for (completed, resource) in resources.iter().rev().enumerate() {
            match with_cancellation(
                cancel,
                "delete_manifests",
                self.applier.delete(resource, options),
            )
            .await
            {
                Ok(message) => debug!(resource = %resource.reference, %message, "deleted"),
                Err(e) if options.ignore_not_found && e.is_not_found() => {
                    debug!(resource = %resource.reference, "already absent");
                }
                Err(e @ Error::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    return Err(Error::delete_failed(
                        resource.reference.to_string(),
                        completed,
                        e.to_string(),
                    ))
                }
            }
        }

        Ok(resources.len())
    }
}
