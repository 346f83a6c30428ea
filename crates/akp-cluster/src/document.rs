//! Decoding desired state from external JSON documents
//!
//! The configuration front-end hands over plain JSON. A missing key decodes
//! to unknown, `null` to null, and anything else to known. A value of the
//! wrong shape is reported as a conversion diagnostic and the field is left
//! unknown so decoding of sibling fields carries on.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use akp_common::{Error, Tristate};

use crate::diagnostics::Diagnostics;
use crate::types::{ClusterCredentials, ClusterDesiredState, ManagedClusterRef, RepoServerDelegate};

/// Types that decode from a JSON object field by field
pub trait FromDocument: Sized {
    /// Decode from an object, reporting bad fields under `path`
    fn from_object(object: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Self;

    /// Decode from any value; a non-object yields `None` and a diagnostic
    fn from_document(value: &Value, path: &str, diags: &mut Diagnostics) -> Option<Self> {
        match value.as_object() {
            Some(object) => Some(Self::from_object(object, path, diags)),
            None => {
                report(
                    diags,
                    path,
                    format!("expected an object, found {}", value_kind(value)),
                );
                None
            }
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn report(diags: &mut Diagnostics, field: &str, message: String) {
    let err = Error::conversion(field, message);
    diags.add_err("Conversion error", &err);
}

/// Decode a scalar or collection field
pub fn decode_field<T: DeserializeOwned>(
    object: &Map<String, Value>,
    key: &str,
    path: &str,
    diags: &mut Diagnostics,
) -> Tristate<T> {
    match object.get(key) {
        None => Tristate::Unknown,
        Some(Value::Null) => Tristate::Null,
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(v) => Tristate::Known(v),
            Err(e) => {
                report(diags, &join(path, key), e.to_string());
                Tristate::Unknown
            }
        },
    }
}

/// Decode a nested object field
pub fn decode_object<T: FromDocument>(
    object: &Map<String, Value>,
    key: &str,
    path: &str,
    diags: &mut Diagnostics,
) -> Tristate<T> {
    let field = join(path, key);
    match object.get(key) {
        None => Tristate::Unknown,
        Some(Value::Null) => Tristate::Null,
        Some(value) => match T::from_document(value, &field, diags) {
            Some(v) => Tristate::Known(v),
            None => Tristate::Unknown,
        },
    }
}

impl FromDocument for ManagedClusterRef {
    fn from_object(object: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Self {
        Self {
            cluster_name: decode_field(object, "cluster_name", path, diags),
        }
    }
}

impl FromDocument for RepoServerDelegate {
    fn from_object(object: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Self {
        Self {
            control_plane: decode_field(object, "control_plane", path, diags),
            managed_cluster: decode_object(object, "managed_cluster", path, diags),
        }
    }
}

impl FromDocument for ClusterCredentials {
    fn from_object(object: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Self {
        Self {
            host: decode_field(object, "host", path, diags),
            username: decode_field(object, "username", path, diags),
            password: decode_field(object, "password", path, diags),
            insecure: decode_field(object, "insecure", path, diags),
            client_certificate: decode_field(object, "client_certificate", path, diags),
            client_key: decode_field(object, "client_key", path, diags),
            cluster_ca_certificate: decode_field(object, "cluster_ca_certificate", path, diags),
            token: decode_field(object, "token", path, diags),
            config_path: decode_field(object, "config_path", path, diags),
            config_context: decode_field(object, "config_context", path, diags),
            raw_kubeconfig: decode_field(object, "raw_kubeconfig", path, diags),
        }
    }
}

impl FromDocument for ClusterDesiredState {
    fn from_object(object: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Self {
        Self {
            id: decode_field(object, "id", path, diags),
            instance_id: decode_field(object, "instance_id", path, diags),
            name: decode_field(object, "name", path, diags),
            description: decode_field(object, "description", path, diags),
            namespace: decode_field(object, "namespace", path, diags),
            namespace_scoped: decode_field(object, "namespace_scoped", path, diags),
            size: decode_field(object, "size", path, diags),
            auto_upgrade_disabled: decode_field(object, "auto_upgrade_disabled", path, diags),
            custom_image_registry_argoproj: decode_field(
                object,
                "custom_image_registry_argoproj",
                path,
                diags,
            ),
            custom_image_registry_akuity: decode_field(
                object,
                "custom_image_registry_akuity",
                path,
                diags,
            ),
            labels: decode_field(object, "labels", path, diags),
            annotations: decode_field(object, "annotations", path, diags),
            kube_config: decode_object(object, "kube_config", path, diags),
            repo_server_delegate: decode_object(object, "repo_server_delegate", path, diags),
        }
    }
}

/// Decode a whole desired-state document; a non-object decodes to all unknown
pub fn decode_desired_state(document: &Value, diags: &mut Diagnostics) -> ClusterDesiredState {
    ClusterDesiredState::from_document(document, "", diags).unwrap_or_default()
}
