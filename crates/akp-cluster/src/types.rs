//! Cluster data model
//!
//! [`ClusterDesiredState`] is what a caller wants; every field is a
//! [`Tristate`] so a partial plan can be merged over persisted state.
//! [`ClusterObservedState`] is a projection of the last remote record and is
//! replaced wholesale after every remote call.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use akp_common::{Error, Tristate};

use crate::api::{
    ClusterData, ClusterRecord, ManagedClusterData, RepoServerDelegateData,
};

/// Agent footprint requested for the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSize {
    /// Small agent footprint
    Small,
    /// Medium agent footprint
    Medium,
    /// Large agent footprint
    Large,
}

impl ClusterSize {
    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterSize::Small => "small",
            ClusterSize::Medium => "medium",
            ClusterSize::Large => "large",
        }
    }
}

impl fmt::Display for ClusterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(ClusterSize::Small),
            "medium" => Ok(ClusterSize::Medium),
            "large" => Ok(ClusterSize::Large),
            other => Err(Error::conversion(
                "size",
                format!("unknown cluster size '{other}', expected small, medium or large"),
            )),
        }
    }
}

/// Backend reconciliation progress
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatusCode {
    /// No status reported yet
    #[default]
    Unspecified,
    /// The backend finished applying the record
    Successful,
    /// The backend is still applying the record
    Progressing,
    /// The backend gave up applying the record
    Failed,
}

impl ReconciliationStatusCode {
    /// Whether polling should stop at this code
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

impl fmt::Display for ReconciliationStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Successful => "SUCCESSFUL",
            Self::Progressing => "PROGRESSING",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Backend view of the installed agent's condition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatusCode {
    /// No status reported yet
    #[default]
    Unspecified,
    /// Agent is running and connected
    Healthy,
    /// Agent is starting
    Progressing,
    /// Agent is running but impaired
    Degraded,
    /// Backend cannot tell
    Unknown,
}

impl HealthStatusCode {
    /// Whether polling should stop at this code
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for HealthStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Healthy => "HEALTHY",
            Self::Progressing => "PROGRESSING",
            Self::Degraded => "DEGRADED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Reconciliation code plus backend message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStatus {
    /// Status code
    pub code: ReconciliationStatusCode,
    /// Free-text detail from the backend
    #[serde(default)]
    pub message: String,
}

impl ReconciliationStatus {
    /// Build a status with an empty message
    pub fn new(code: ReconciliationStatusCode) -> Self {
        Self {
            code,
            message: String::new(),
        }
    }
}

/// Health code plus backend message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Status code
    pub code: HealthStatusCode,
    /// Free-text detail from the backend
    #[serde(default)]
    pub message: String,
}

impl HealthStatus {
    /// Build a status with an empty message
    pub fn new(code: HealthStatusCode) -> Self {
        Self {
            code,
            message: String::new(),
        }
    }
}

/// Reference to the managed cluster hosting a delegated repo server
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedClusterRef {
    /// Name of the managed cluster
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub cluster_name: Tristate<String>,
}

/// Where the repo server for this cluster runs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoServerDelegate {
    /// Run the repo server in the control plane
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub control_plane: Tristate<bool>,
    /// Run the repo server in a managed cluster
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub managed_cluster: Tristate<ManagedClusterRef>,
}

/// Credentials used to reach the target Kubernetes cluster
///
/// Sources are tried in order: `raw_kubeconfig`, `config_path`, then the
/// inline `host` with token or client certificate.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCredentials {
    /// API server URL
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub host: Tristate<String>,
    /// Basic-auth user
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub username: Tristate<String>,
    /// Basic-auth password
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub password: Tristate<String>,
    /// Skip TLS verification
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub insecure: Tristate<bool>,
    /// PEM client certificate
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub client_certificate: Tristate<String>,
    /// PEM client key
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub client_key: Tristate<String>,
    /// PEM CA bundle for the API server
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub cluster_ca_certificate: Tristate<String>,
    /// Bearer token
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub token: Tristate<String>,
    /// Path to a kubeconfig file
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub config_path: Tristate<String>,
    /// Context to select from the kubeconfig
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub config_context: Tristate<String>,
    /// Whole kubeconfig document as text
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub raw_kubeconfig: Tristate<String>,
}

fn presence<T>(value: &Tristate<T>) -> &'static str {
    match value {
        Tristate::Unknown => "<unknown>",
        Tristate::Null => "<null>",
        Tristate::Known(_) => "<redacted>",
    }
}

impl fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCredentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &presence(&self.password))
            .field("insecure", &self.insecure)
            .field("client_certificate", &presence(&self.client_certificate))
            .field("client_key", &presence(&self.client_key))
            .field("cluster_ca_certificate", &presence(&self.cluster_ca_certificate))
            .field("token", &presence(&self.token))
            .field("config_path", &self.config_path)
            .field("config_context", &self.config_context)
            .field("raw_kubeconfig", &presence(&self.raw_kubeconfig))
            .finish()
    }
}

/// Configuration a caller wants the cluster to have
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDesiredState {
    /// Backend identifier, unknown until created
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub id: Tristate<String>,
    /// Owning instance
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub instance_id: Tristate<String>,
    /// Cluster name, unique within the instance
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub name: Tristate<String>,
    /// Free-text description
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub description: Tristate<String>,
    /// Namespace the agent is installed into
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub namespace: Tristate<String>,
    /// Restrict the agent to its namespace
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub namespace_scoped: Tristate<bool>,
    /// Agent footprint
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub size: Tristate<ClusterSize>,
    /// Leave agent upgrades to the caller instead of the backend
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub auto_upgrade_disabled: Tristate<bool>,
    /// Registry override for argoproj images
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub custom_image_registry_argoproj: Tristate<String>,
    /// Registry override for akuity images
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub custom_image_registry_akuity: Tristate<String>,
    /// Labels applied to agent resources
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub labels: Tristate<BTreeMap<String, String>>,
    /// Annotations applied to agent resources
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub annotations: Tristate<BTreeMap<String, String>>,
    /// Access to the target cluster for installing the agent
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub kube_config: Tristate<ClusterCredentials>,
    /// Repo server placement
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub repo_server_delegate: Tristate<RepoServerDelegate>,
}

fn non_empty(value: &Option<String>) -> Tristate<String> {
    match value.as_deref() {
        Some(s) if !s.is_empty() => Tristate::known(s.to_string()),
        _ => Tristate::Null,
    }
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Tristate<BTreeMap<String, String>> {
    if map.is_empty() {
        Tristate::Null
    } else {
        Tristate::known(map.clone())
    }
}

impl ClusterDesiredState {
    /// Overwrite the backend-owned fields from a remote record.
    ///
    /// `instance_id` and `kube_config` are caller inputs and are left alone.
    /// Empty strings, empty maps and unspecified enums from the backend
    /// become null.
    pub fn refresh_from(&mut self, record: &ClusterRecord) {
        let data = &record.data;
        self.id = Tristate::known(record.id.clone());
        self.name = Tristate::known(record.name.clone());
        self.description = Tristate::known(record.description.clone());
        self.namespace = Tristate::known(record.namespace.clone());
        self.namespace_scoped = Tristate::known(record.namespace_scoped);
        self.size = Tristate::from_option(data.size);
        self.auto_upgrade_disabled = Tristate::known(data.auto_upgrade_disabled.unwrap_or(false));
        self.custom_image_registry_argoproj = non_empty(&data.custom_image_registry_argoproj);
        self.custom_image_registry_akuity = non_empty(&data.custom_image_registry_akuity);
        self.labels = non_empty_map(&data.labels);
        self.annotations = non_empty_map(&data.annotations);
        self.repo_server_delegate = match &data.repo_server_delegate {
            Some(delegate) => Tristate::known(RepoServerDelegate {
                control_plane: Tristate::known(delegate.control_plane),
                managed_cluster: match &delegate.managed_cluster {
                    Some(mc) if !mc.cluster_name.is_empty() => Tristate::known(ManagedClusterRef {
                        cluster_name: Tristate::known(mc.cluster_name.clone()),
                    }),
                    _ => Tristate::Null,
                },
            }),
            None => Tristate::Null,
        };
    }

    /// Build the backend payload; null and unknown fields are sent as unset
    pub fn to_cluster_data(&self) -> ClusterData {
        ClusterData {
            size: self.size.as_known().copied(),
            custom_image_registry_argoproj: Some(
                self.custom_image_registry_argoproj.value_str().to_string(),
            ),
            custom_image_registry_akuity: Some(
                self.custom_image_registry_akuity.value_str().to_string(),
            ),
            auto_upgrade_disabled: Some(self.auto_upgrade_disabled.value_bool()),
            labels: self.labels.value_or_default(),
            annotations: self.annotations.value_or_default(),
            repo_server_delegate: self.repo_server_delegate.as_known().map(|delegate| {
                RepoServerDelegateData {
                    control_plane: delegate.control_plane.value_bool(),
                    managed_cluster: delegate.managed_cluster.as_known().map(|mc| {
                        ManagedClusterData {
                            cluster_name: mc.cluster_name.value_str().to_string(),
                        }
                    }),
                }
            }),
        }
    }

    /// Whether the caller controls agent upgrades
    pub fn auto_upgrade_disabled(&self) -> bool {
        self.auto_upgrade_disabled.value_bool()
    }
}

/// What the system believes the cluster has, as last read
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterObservedState {
    /// Backend identifier
    pub id: String,
    /// Agent install manifests; unknown until fetched
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub manifests: Tristate<String>,
    /// Namespace the agent runs in
    pub namespace: String,
    /// Installed agent version; null until an install has been observed
    #[serde(default, skip_serializing_if = "Tristate::is_unknown")]
    pub agent_version: Tristate<String>,
    /// Backend reconciliation status
    pub reconciliation_status: ReconciliationStatus,
    /// Backend health status
    pub health_status: HealthStatus,
}

impl ClusterObservedState {
    /// Project a remote record. Manifests are left unknown and the agent
    /// version is taken from the record when it reports one.
    pub fn from_record(record: &ClusterRecord) -> Self {
        Self {
            id: record.id.clone(),
            manifests: Tristate::Unknown,
            namespace: record.namespace.clone(),
            agent_version: agent_version(record),
            reconciliation_status: record.reconciliation_status.clone(),
            health_status: record.health_status.clone(),
        }
    }
}

/// Agent version reported by a record, null when the agent never checked in
pub fn agent_version(record: &ClusterRecord) -> Tristate<String> {
    non_empty(&record.agent_state.as_ref().map(|s| s.version.clone()))
}

impl fmt::Debug for ClusterObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterObservedState")
            .field("id", &self.id)
            .field("manifests", &presence(&self.manifests))
            .field("namespace", &self.namespace)
            .field("agent_version", &self.agent_version)
            .field("reconciliation_status", &self.reconciliation_status)
            .field("health_status", &self.health_status)
            .finish()
    }
}

/// The persisted pair a caller stores between operations
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Desired configuration after the last successful operation
    pub desired: ClusterDesiredState,
    /// Observed state after the last successful operation
    pub observed: ClusterObservedState,
}

impl ClusterState {
    /// Build the state for a freshly fetched record
    pub fn from_record(mut desired: ClusterDesiredState, record: &ClusterRecord) -> Self {
        desired.refresh_from(record);
        Self {
            desired,
            observed: ClusterObservedState::from_record(record),
        }
    }

    /// Backend identifier, preferring the observed one
    pub fn id(&self) -> &str {
        if self.observed.id.is_empty() {
            self.desired.id.value_str()
        } else {
            &self.observed.id
        }
    }

    /// Owning instance
    pub fn instance_id(&self) -> &str {
        self.desired.instance_id.value_str()
    }
}
