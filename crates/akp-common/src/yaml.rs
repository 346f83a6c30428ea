//! YAML parsing utilities using yaml-rust2
//!
//! Provides multi-document YAML parsing with conversion to serde_json::Value
//! for typed deserialization. Documents are split on `---` boundaries before
//! parsing so that one malformed document is reported by its index instead of
//! failing the whole stream.

use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// Error type for YAML parsing
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct YamlError(String);

/// One parsed document of a multi-document stream
#[derive(Debug, Clone, PartialEq)]
pub struct YamlDocument {
    /// Zero-based position of the document in the stream
    pub index: usize,
    /// Parsed content
    pub value: Value,
}

/// Split a multi-document stream on `---` separator lines.
///
/// The separator must start the line; anything after `--- ` on the same line
/// belongs to the following document. A `...` end marker is dropped.
/// The split is line based, so a `---` at the start of a line inside a
/// quoted or flow scalar is taken as a separator too.
pub fn split_documents(input: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();

    for line in input.lines() {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed.starts_with("--- ") {
            docs.push(std::mem::take(&mut current));
            if let Some(rest) = trimmed.strip_prefix("--- ") {
                current.push_str(rest);
                current.push('\n');
            }
            continue;
        }
        if trimmed == "..." {
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    docs.push(current);
    docs
}

/// Parse a single YAML document into a serde_json::Value.
///
/// Returns `Value::Null` for empty or comment-only input.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a multi-document YAML string, one result per non-empty document.
///
/// Each document is decoded independently. Empty documents (blank,
/// comment-only, or an explicit `null`) are skipped but still count towards
/// the index so errors point at the right place in the input.
pub fn parse_yaml_multi(input: &str) -> Vec<Result<YamlDocument, (usize, YamlError)>> {
    split_documents(input)
        .iter()
        .enumerate()
        .filter_map(|(index, doc)| match parse_yaml(doc) {
            Ok(Value::Null) => None,
            Ok(value) => Some(Ok(YamlDocument { index, value })),
            Err(e) => Some(Err((index, e))),
        })
        .collect()
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}
