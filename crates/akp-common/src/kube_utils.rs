//! Shared Kubernetes utilities using kube-rs
//!
//! Provides the kubectl-equivalent operations the agent installer needs:
//! manifest descriptor parsing, create-or-replace apply, delete with
//! kubectl-style options, and client construction from a kubeconfig.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DeleteParams, DynamicObject, PostParams, PropagationPolicy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::{Client, Config};
use tracing::{debug, trace};

use crate::yaml::parse_yaml_multi;
use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Polling interval while waiting for a deleted object to disappear
pub const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(2);

// =============================================================================
// Manifest descriptors
// =============================================================================

/// Identity of a Kubernetes object: (apiVersion, kind, namespace, name)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Full API version (e.g., "apps/v1", "v1")
    pub api_version: String,
    /// Resource kind (e.g., "Deployment")
    pub kind: String,
    /// Namespace, if the manifest names one
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A parsed manifest document ready to send to the API server
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestResource {
    /// Object identity extracted from the document
    pub reference: ResourceRef,
    /// The full object as JSON
    pub value: serde_json::Value,
}

impl ManifestResource {
    /// Build a descriptor from a decoded document.
    ///
    /// `document` is the position of the document in its bundle and is only
    /// used for error reporting.
    pub fn from_value(document: usize, value: serde_json::Value) -> Result<Self, Error> {
        if !value.is_object() {
            return Err(Error::malformed_manifest(
                document,
                "top-level value is not a mapping",
            ));
        }

        let api_version = required_str(&value, "/apiVersion", document)?;
        let kind = required_str(&value, "/kind", document)?;
        if !value.get("metadata").is_some_and(|m| m.is_object()) {
            return Err(Error::malformed_manifest(document, "missing metadata"));
        }
        let name = required_str(&value, "/metadata/name", document)?;
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            reference: ResourceRef {
                api_version,
                kind,
                namespace,
                name,
            },
            value,
        })
    }

    /// Group/version/kind of this resource
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = parse_api_version(&self.reference.api_version);
        GroupVersionKind::gvk(&group, &version, &self.reference.kind)
    }
}

fn required_str(value: &serde_json::Value, pointer: &str, document: usize) -> Result<String, Error> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::malformed_manifest(
                document,
                format!("missing {}", pointer.trim_start_matches('/').replace('/', ".")),
            )
        })
}

/// Parse a multi-document manifest bundle into descriptors, in document order.
///
/// Fails on the first document that is not valid YAML or lacks
/// apiVersion/kind/metadata.name.
pub fn parse_manifests(text: &str) -> Result<Vec<ManifestResource>, Error> {
    parse_yaml_multi(text)
        .into_iter()
        .map(|doc| match doc {
            Ok(doc) => ManifestResource::from_value(doc.index, doc.value),
            Err((index, e)) => Err(Error::malformed_manifest(index, format!("invalid YAML: {e}"))),
        })
        .collect()
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use akp_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Check whether a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

// =============================================================================
// Client construction
// =============================================================================

/// Build a kube [`Client`] from an already-loaded [`Kubeconfig`].
///
/// `context` selects a kubeconfig context; `None` uses current-context.
pub async fn client_from_kubeconfig(
    kubeconfig: Kubeconfig,
    context: Option<&str>,
) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig: {e}")))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| Error::config(format!("failed to create client: {e}")))
}

/// Build a kube [`Client`] from a kubeconfig file path
pub async fn client_from_path(path: &Path, context: Option<&str>) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::config(format!(
            "failed to read kubeconfig {}: {}",
            path.display(),
            e
        ))
    })?;
    client_from_kubeconfig(kubeconfig, context).await
}

// =============================================================================
// Apply / delete
// =============================================================================

/// Result of a create-or-replace apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object did not exist and was created
    Created,
    /// The object existed and was replaced
    Configured,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Created => write!(f, "created"),
            ApplyOutcome::Configured => write!(f, "configured"),
        }
    }
}

/// Result of a delete
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object existed and was deleted
    Deleted,
    /// The object was already gone and not-found was ignored
    NotFound,
}

impl fmt::Display for DeleteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteOutcome::Deleted => write!(f, "deleted"),
            DeleteOutcome::NotFound => write!(f, "not found"),
        }
    }
}

/// kubectl-style delete options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Treat a missing object as success
    pub ignore_not_found: bool,
    /// Block until the object is confirmed gone or the timeout elapses
    pub wait_for_deletion: bool,
    /// Skip the graceful-termination grace period
    pub force: bool,
}

/// Resolve the API resource and scope for a manifest via discovery
pub async fn resolve_api_resource(
    client: &Client,
    resource: &ManifestResource,
) -> Result<(ApiResource, ApiCapabilities), Error> {
    kube::discovery::pinned_kind(client, &resource.gvk())
        .await
        .map_err(Error::from)
}

/// Build a dynamic API handle for a manifest.
///
/// Namespaced kinds without a namespace in the manifest land in the client's
/// default namespace, as kubectl does.
pub fn dynamic_api(
    client: &Client,
    resource: &ManifestResource,
    api_resource: &ApiResource,
    capabilities: &ApiCapabilities,
) -> Api<DynamicObject> {
    match capabilities.scope {
        Scope::Cluster => Api::all_with(client.clone(), api_resource),
        Scope::Namespaced => {
            let ns = resource
                .reference
                .namespace
                .as_deref()
                .unwrap_or_else(|| client.default_namespace());
            Api::namespaced_with(client.clone(), ns, api_resource)
        }
    }
}

/// Create the object if absent, else replace it with the live resourceVersion
pub async fn create_or_replace(
    api: &Api<DynamicObject>,
    resource: &ManifestResource,
    field_manager: &str,
) -> Result<ApplyOutcome, Error> {
    let mut obj: DynamicObject = serde_json::from_value(resource.value.clone())
        .map_err(|e| Error::conversion(resource.reference.to_string(), e.to_string()))?;
    let params = PostParams {
        field_manager: Some(field_manager.to_string()),
        ..Default::default()
    };
    let name = &resource.reference.name;

    match api.get_opt(name).await? {
        None => {
            api.create(&params, &obj).await?;
            trace!(resource = %resource.reference, "created");
            Ok(ApplyOutcome::Created)
        }
        Some(live) => {
            obj.metadata.resource_version = live.metadata.resource_version;
            api.replace(name, &params, &obj).await?;
            trace!(resource = %resource.reference, "replaced");
            Ok(ApplyOutcome::Configured)
        }
    }
}

/// Delete an object according to kubectl-style options.
///
/// With `wait_for_deletion`, polls until the object is gone or
/// `deletion_timeout` elapses.
pub async fn delete_resource(
    api: &Api<DynamicObject>,
    resource: &ManifestResource,
    options: &DeleteOptions,
    deletion_timeout: Duration,
) -> Result<DeleteOutcome, Error> {
    let mut params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };
    if options.force {
        params.grace_period_seconds = Some(0);
    }
    let name = &resource.reference.name;

    match api.delete(name, &params).await {
        Ok(_) => {}
        Err(e) if options.ignore_not_found && is_not_found(&e) => {
            debug!(resource = %resource.reference, "already absent");
            return Ok(DeleteOutcome::NotFound);
        }
        Err(e) => return Err(e.into()),
    }

    if options.wait_for_deletion {
        poll_until(
            deletion_timeout,
            DELETION_POLL_INTERVAL,
            format!("timeout waiting for {} to be deleted", resource.reference),
            || async { Ok::<bool, Error>(api.get_opt(name).await?.is_none()) },
        )
        .await?;
    }

    Ok(DeleteOutcome::Deleted)
}

/// Poll until a condition is met or timeout is reached
///
/// Repeatedly calls `check_fn` until it returns `Ok(true)` or the timeout is
/// exceeded. Unlike the status poller, check errors end the wait immediately.
///
/// # Arguments
/// * `timeout` - Maximum time to wait for the condition
/// * `poll_interval` - Time between polling attempts
/// * `timeout_msg` - Error message to use on timeout
/// * `check_fn` - Async function that returns `Ok(true)` when condition is met
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if check_fn().await? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }
        trace!("polling condition not yet met");
        tokio::time::sleep(poll_interval).await;
    }
}
