//! Tri-state merge of a caller's plan over persisted desired state
//!
//! Per field: unknown in the plan keeps the prior value, null clears it, and
//! a known value replaces it. Nested objects follow the same rule as a
//! whole; a known nested plan recurses into the prior object, or into an
//! all-null object when there was none.

use serde_json::Value;

use akp_common::Tristate;

use crate::diagnostics::Diagnostics;
use crate::document::decode_desired_state;
use crate::types::{ClusterCredentials, ClusterDesiredState, ManagedClusterRef, RepoServerDelegate};

/// Field-wise tri-state merge for desired-state objects
pub trait Merge: Clone {
    /// Merge `incoming` over `self`
    fn merge(&self, incoming: &Self) -> Self;

    /// An instance with every field null, used as the base when there is no prior object
    fn all_null() -> Self;
}

/// Merge a nested object field
pub fn merge_object<T: Merge>(prior: &Tristate<T>, incoming: &Tristate<T>) -> Tristate<T> {
    match incoming {
        Tristate::Unknown => prior.clone(),
        Tristate::Null => Tristate::Null,
        Tristate::Known(plan) => {
            let base = prior.as_known().cloned().unwrap_or_else(T::all_null);
            Tristate::Known(base.merge(plan))
        }
    }
}

impl Merge for ManagedClusterRef {
    fn merge(&self, incoming: &Self) -> Self {
        Self {
            cluster_name: self.cluster_name.merge(&incoming.cluster_name),
        }
    }

    fn all_null() -> Self {
        Self {
            cluster_name: Tristate::Null,
        }
    }
}

impl Merge for RepoServerDelegate {
    fn merge(&self, incoming: &Self) -> Self {
        Self {
            control_plane: self.control_plane.merge(&incoming.control_plane),
            managed_cluster: merge_object(&self.managed_cluster, &incoming.managed_cluster),
        }
    }

    fn all_null() -> Self {
        Self {
            control_plane: Tristate::Null,
            managed_cluster: Tristate::Null,
        }
    }
}

impl Merge for ClusterCredentials {
    fn merge(&self, incoming: &Self) -> Self {
        Self {
            host: self.host.merge(&incoming.host),
            username: self.username.merge(&incoming.username),
            password: self.password.merge(&incoming.password),
            insecure: self.insecure.merge(&incoming.insecure),
            client_certificate: self.client_certificate.merge(&incoming.client_certificate),
            client_key: self.client_key.merge(&incoming.client_key),
            cluster_ca_certificate: self
                .cluster_ca_certificate
                .merge(&incoming.cluster_ca_certificate),
            token: self.token.merge(&incoming.token),
            config_path: self.config_path.merge(&incoming.config_path),
            config_context: self.config_context.merge(&incoming.config_context),
            raw_kubeconfig: self.raw_kubeconfig.merge(&incoming.raw_kubeconfig),
        }
    }

    fn all_null() -> Self {
        Self {
            host: Tristate::Null,
            username: Tristate::Null,
            password: Tristate::Null,
            insecure: Tristate::Null,
            client_certificate: Tristate::Null,
            client_key: Tristate::Null,
            cluster_ca_certificate: Tristate::Null,
            token: Tristate::Null,
            config_path: Tristate::Null,
            config_context: Tristate::Null,
            raw_kubeconfig: Tristate::Null,
        }
    }
}

impl Merge for ClusterDesiredState {
    fn merge(&self, incoming: &Self) -> Self {
        Self {
            id: self.id.merge(&incoming.id),
            instance_id: self.instance_id.merge(&incoming.instance_id),
            name: self.name.merge(&incoming.name),
            description: self.description.merge(&incoming.description),
            namespace: self.namespace.merge(&incoming.namespace),
            namespace_scoped: self.namespace_scoped.merge(&incoming.namespace_scoped),
            size: self.size.merge(&incoming.size),
            auto_upgrade_disabled: self.auto_upgrade_disabled.merge(&incoming.auto_upgrade_disabled),
            custom_image_registry_argoproj: self
                .custom_image_registry_argoproj
                .merge(&incoming.custom_image_registry_argoproj),
            custom_image_registry_akuity: self
                .custom_image_registry_akuity
                .merge(&incoming.custom_image_registry_akuity),
            labels: self.labels.merge(&incoming.labels),
            annotations: self.annotations.merge(&incoming.annotations),
            kube_config: merge_object(&self.kube_config, &incoming.kube_config),
            repo_server_delegate: merge_object(
                &self.repo_server_delegate,
                &incoming.repo_server_delegate,
            ),
        }
    }

    fn all_null() -> Self {
        Self {
            id: Tristate::Null,
            instance_id: Tristate::Null,
            name: Tristate::Null,
            description: Tristate::Null,
            namespace: Tristate::Null,
            namespace_scoped: Tristate::Null,
            size: Tristate::Null,
            auto_upgrade_disabled: Tristate::Null,
            custom_image_registry_argoproj: Tristate::Null,
            custom_image_registry_akuity: Tristate::Null,
            labels: Tristate::Null,
            annotations: Tristate::Null,
            kube_config: Tristate::Null,
            repo_server_delegate: Tristate::Null,
        }
    }
}

/// Merge two external documents.
///
/// Both sides are decoded first; fields that fail to decode are reported
/// and treated as unknown, so the prior value survives a malformed plan field.
pub fn merge_documents(prior: &Value, incoming: &Value) -> (ClusterDesiredState, Diagnostics) {
    let mut diags = Diagnostics::new();
    let prior = decode_desired_state(prior, &mut diags);
    let incoming = decode_desired_state(incoming, &mut diags);
    (prior.merge(&incoming), diags)
}
