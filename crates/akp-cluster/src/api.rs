//! Remote cluster API
//!
//! The transport and authentication client lives outside this crate; the
//! reconciler only sees [`ClusterApi`]. Implementations must map a missing
//! record to [`Error::NotFound`] and everything else to [`Error::Transport`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use akp_common::Error;

use crate::types::{ClusterSize, HealthStatus, ReconciliationStatus};

#[cfg(test)]
use mockall::automock;

/// Managed-cluster reference as stored by the backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedClusterData {
    /// Name of the managed cluster
    pub cluster_name: String,
}

/// Repo-server delegate as stored by the backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoServerDelegateData {
    /// Run in the control plane
    pub control_plane: bool,
    /// Run in a managed cluster
    pub managed_cluster: Option<ManagedClusterData>,
}

/// Mutable cluster settings sent on create and update
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterData {
    /// Agent footprint; `None` is the backend's unspecified size
    pub size: Option<ClusterSize>,
    /// Registry override for argoproj images
    pub custom_image_registry_argoproj: Option<String>,
    /// Registry override for akuity images
    pub custom_image_registry_akuity: Option<String>,
    /// Leave agent upgrades to the caller
    pub auto_upgrade_disabled: Option<bool>,
    /// Labels applied to agent resources
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations applied to agent resources
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Repo server placement
    pub repo_server_delegate: Option<RepoServerDelegateData>,
}

/// Agent self-report
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Installed agent version
    pub version: String,
}

/// A cluster as returned by the backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Backend identifier
    pub id: String,
    /// Cluster name
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Agent namespace
    pub namespace: String,
    /// Agent restricted to its namespace
    pub namespace_scoped: bool,
    /// Mutable settings
    pub data: ClusterData,
    /// Backend reconciliation progress
    pub reconciliation_status: ReconciliationStatus,
    /// Agent health as seen by the backend
    pub health_status: HealthStatus,
    /// Agent self-report, absent until the agent connects
    pub agent_state: Option<AgentState>,
}

/// Payload for creating a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    /// Owning organization
    pub organization_id: String,
    /// Owning instance
    pub instance_id: String,
    /// Cluster name
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Agent namespace
    pub namespace: String,
    /// Agent restricted to its namespace
    pub namespace_scoped: bool,
    /// Mutable settings
    pub data: ClusterData,
    /// Overwrite an existing cluster with the same name
    pub upsert: bool,
}

/// Payload for updating a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClusterRequest {
    /// Owning organization
    pub organization_id: String,
    /// Owning instance
    pub instance_id: String,
    /// Cluster to update
    pub id: String,
    /// Free-text description
    pub description: String,
    /// Mutable settings
    pub data: ClusterData,
}

/// Backend operations on instance clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a cluster record
    async fn create_cluster(&self, request: CreateClusterRequest) -> Result<ClusterRecord, Error>;

    /// Fetch a cluster record by identifier
    async fn get_cluster(
        &self,
        organization_id: &str,
        instance_id: &str,
        id: &str,
    ) -> Result<ClusterRecord, Error>;

    /// Update a cluster record
    async fn update_cluster(&self, request: UpdateClusterRequest) -> Result<ClusterRecord, Error>;

    /// Delete a cluster record
    async fn delete_cluster(
        &self,
        organization_id: &str,
        instance_id: &str,
        id: &str,
    ) -> Result<(), Error>;

    /// List the clusters of an instance
    async fn list_clusters(
        &self,
        organization_id: &str,
        instance_id: &str,
    ) -> Result<Vec<ClusterRecord>, Error>;

    /// Fetch the agent install manifests for a cluster as a multi-document bundle
    async fn get_manifests(
        &self,
        organization_id: &str,
        instance_id: &str,
        id: &str,
    ) -> Result<String, Error>;
}
