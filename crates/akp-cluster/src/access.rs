//! Cluster access backed by kube-rs
//!
//! Turns [`ClusterCredentials`] into a kube [`Client`] and applies manifest
//! resources as dynamic objects.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::api::{Api, DynamicObject};
use kube::config::Kubeconfig;
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

use akp_common::kube_utils::{
    client_from_kubeconfig, client_from_path, create_or_replace, delete_resource, dynamic_api,
    parse_api_version, resolve_api_resource, DeleteOptions, ManifestResource,
};
use akp_common::{Error, Result, Tristate};

use crate::config::ReconcilerConfig;
use crate::manifests::{ClusterConnector, ResourceApplier};
use crate::types::ClusterCredentials;

/// Name used for the cluster, user and context of a synthesised kubeconfig
pub const SYNTHETIC_CONTEXT: &str = "akp";

fn present(value: &Tristate<String>) -> Option<&str> {
    value.as_known().map(String::as_str).filter(|s| !s.is_empty())
}

/// Build a kubeconfig document from inline host credentials.
///
/// Certificates are embedded as base64 `*-data` fields. Unset credentials
/// are omitted rather than written as empty strings.
pub fn kubeconfig_document(creds: &ClusterCredentials) -> Result<Value> {
    let host = present(&creds.host)
        .ok_or_else(|| Error::config("host is required for inline credentials"))?;

    let mut cluster = Map::new();
    cluster.insert("server".into(), json!(host));
    if let Some(ca) = present(&creds.cluster_ca_certificate) {
        cluster.insert(
            "certificate-authority-data".into(),
            json!(BASE64.encode(ca)),
        );
    }
    if creds.insecure.value_bool() {
        cluster.insert("insecure-skip-tls-verify".into(), json!(true));
    }

    let mut user = Map::new();
    if let Some(token) = present(&creds.token) {
        user.insert("token".into(), json!(token));
    }
    if let Some(cert) = present(&creds.client_certificate) {
        user.insert("client-certificate-data".into(), json!(BASE64.encode(cert)));
    }
    if let Some(key) = present(&creds.client_key) {
        user.insert("client-key-data".into(), json!(BASE64.encode(key)));
    }
    if let Some(username) = present(&creds.username) {
        user.insert("username".into(), json!(username));
    }
    if let Some(password) = present(&creds.password) {
        user.insert("password".into(), json!(password));
    }

    Ok(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": SYNTHETIC_CONTEXT,
        "clusters": [{"name": SYNTHETIC_CONTEXT, "cluster": cluster}],
        "users": [{"name": SYNTHETIC_CONTEXT, "user": user}],
        "contexts": [{
            "name": SYNTHETIC_CONTEXT,
            "context": {"cluster": SYNTHETIC_CONTEXT, "user": SYNTHETIC_CONTEXT},
        }],
    }))
}

/// Resolve credentials into a [`Kubeconfig`] plus the context to select.
///
/// Sources in order: inline kubeconfig text, kubeconfig path, inline host.
/// Returns `Ok(None)` for a path source, which is read by the client builder.
fn inline_kubeconfig(creds: &ClusterCredentials) -> Result<Option<(Kubeconfig, Option<String>)>> {
    let context = present(&creds.config_context).map(str::to_string);

    if let Some(raw) = present(&creds.raw_kubeconfig) {
        let kubeconfig = Kubeconfig::from_yaml(raw)
            .map_err(|e| Error::config(format!("invalid raw kubeconfig: {e}")))?;
        return Ok(Some((kubeconfig, context)));
    }
    if present(&creds.config_path).is_some() {
        return Ok(None);
    }
    if present(&creds.host).is_some() {
        let kubeconfig: Kubeconfig = serde_json::from_value(kubeconfig_document(creds)?)
            .map_err(|e| Error::config(format!("invalid inline credentials: {e}")))?;
        return Ok(Some((kubeconfig, Some(SYNTHETIC_CONTEXT.to_string()))));
    }
    Err(Error::config(
        "no usable credentials: set raw_kubeconfig, config_path or host",
    ))
}

/// Build a client from cluster credentials
pub async fn build_client(creds: &ClusterCredentials) -> Result<Client> {
    match inline_kubeconfig(creds)? {
        Some((kubeconfig, context)) => client_from_kubeconfig(kubeconfig, context.as_deref()).await,
        None => {
            let path = present(&creds.config_path)
                .ok_or_else(|| Error::config("config_path is empty"))?;
            client_from_path(Path::new(path), present(&creds.config_context)).await
        }
    }
}

/// kubectl-style object name (e.g., "deployment.apps/agent")
pub fn kubectl_name(resource: &ManifestResource) -> String {
    let (group, _) = parse_api_version(&resource.reference.api_version);
    let kind = resource.reference.kind.to_lowercase();
    if group.is_empty() {
        format!("{}/{}", kind, resource.reference.name)
    } else {
        format!("{}.{}/{}", kind, group, resource.reference.name)
    }
}

/// [`ClusterConnector`] backed by kube-rs
pub struct KubeConnector {
    field_manager: String,
    deletion_timeout: Duration,
}

impl KubeConnector {
    /// Create a connector
    pub fn new(field_manager: impl Into<String>, deletion_timeout: Duration) -> Self {
        Self {
            field_manager: field_manager.into(),
            deletion_timeout,
        }
    }

    /// Connector using the field manager and deletion timeout from `config`
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self::new(config.field_manager.clone(), config.deletion_timeout)
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, credentials: &ClusterCredentials) -> Result<Arc<dyn ResourceApplier>> {
        let client = build_client(credentials).await?;
        Ok(Arc::new(KubeApplier {
            client,
            field_manager: self.field_manager.clone(),
            deletion_timeout: self.deletion_timeout,
        }))
    }
}

/// [`ResourceApplier`] backed by a kube [`Client`]
pub struct KubeApplier {
    client: Client,
    field_manager: String,
    deletion_timeout: Duration,
}

impl KubeApplier {
    async fn api_for(&self, resource: &ManifestResource) -> Result<Api<DynamicObject>> {
        let (api_resource, capabilities) = resolve_api_resource(&self.client, resource).await?;
        Ok(dynamic_api(&self.client, resource, &api_resource, &capabilities))
    }
}

#[async_trait]
impl ResourceApplier for KubeApplier {
    async fn apply(&self, resource: &ManifestResource) -> Result<String> {
        let api = self.api_for(resource).await?;
        let outcome = create_or_replace(&api, resource, &self.field_manager).await?;
        Ok(format!("{} {}", kubectl_name(resource), outcome))
    }

    async fn delete(&self, resource: &ManifestResource, options: &DeleteOptions) -> Result<String> {
        let api = match self.api_for(resource).await {
            Ok(api) => api,
            // The kind itself is gone (e.g., its CRD was removed first)
            Err(e) if options.ignore_not_found && e.is_not_found() => {
                debug!(resource = %resource.reference, "kind no longer served");
                return Ok(format!("{} not found", kubectl_name(resource)));
            }
            Err(e) => return Err(e),
        };
        let outcome = delete_resource(&api, resource, options, self.deletion_timeout).await?;
        Ok(format!("{} {}", kubectl_name(resource), outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use akp_common::kube_utils::parse_manifests;

    fn creds() -> ClusterCredentials {
        ClusterCredentials {
            host: Tristate::known("https://10.0.0.1:6443".to_string()),
            token: Tristate::known("abc".to_string()),
            cluster_ca_certificate: Tristate::known("-----BEGIN CERTIFICATE-----".to_string()),
            client_key: Tristate::known(String::new()),
            ..Default::default()
        }
    }

    #[test]
    fn test_kubeconfig_document_embeds_credentials() {
        let doc = kubeconfig_document(&creds()).unwrap();
        assert_eq!(doc["current-context"], SYNTHETIC_CONTEXT);
        let cluster = &doc["clusters"][0]["cluster"];
        assert_eq!(cluster["server"], "https://10.0.0.1:6443");
        assert_eq!(
            cluster["certificate-authority-data"],
            BASE64.encode("-----BEGIN CERTIFICATE-----")
        );
        assert!(cluster.get("insecure-skip-tls-verify").is_none());

        let user = &doc["users"][0]["user"];
        assert_eq!(user["token"], "abc");
        // Empty strings are treated as unset
        assert!(user.get("client-key-data").is_none());
    }

    #[test]
    fn test_kubeconfig_document_deserializes() {
        let doc = kubeconfig_document(&ClusterCredentials {
            insecure: Tristate::known(true),
            ..creds()
        })
        .unwrap();
        let kubeconfig: Kubeconfig = serde_json::from_value(doc).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some(SYNTHETIC_CONTEXT));
        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(kubeconfig.auth_infos.len(), 1);
    }

    #[test]
    fn test_kubeconfig_document_requires_host() {
        let err = kubeconfig_document(&ClusterCredentials::default()).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_no_credentials_is_a_config_error() {
        let err = build_client(&ClusterCredentials::default()).await.err().expect("expected an error");
        assert!(matches!(err, Error::Config { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unparseable_raw_kubeconfig_is_a_config_error() {
        let creds = ClusterCredentials {
            raw_kubeconfig: Tristate::known("clusters: [unterminated".to_string()),
            host: Tristate::known("https://ignored".to_string()),
            ..Default::default()
        };
        let err = build_client(&creds).await.err().expect("expected an error");
        assert!(err.to_string().contains("raw kubeconfig"));
    }

    #[test]
    fn test_connector_takes_settings_from_config() {
        let mut config = ReconcilerConfig::new("org-1");
        config.field_manager = "custom-manager".to_string();
        config.deletion_timeout = Duration::from_secs(30);

        let connector = KubeConnector::from_config(&config);
        assert_eq!(connector.field_manager, "custom-manager");
        assert_eq!(connector.deletion_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connector_rejects_missing_credentials() {
        let connector = KubeConnector::from_config(&ReconcilerConfig::new("org-1"));
        let err = match connector.connect(&ClusterCredentials::default()).await {
            Ok(_) => panic!("expected a config error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_kubectl_name() {
        let resources = parse_manifests(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: agent\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: token\n",
        )
        .unwrap();
        assert_eq!(kubectl_name(&resources[0]), "deployment.apps/agent");
        assert_eq!(kubectl_name(&resources[1]), "secret/token");
    }
}
