//! Manifest document model.
//!
//! A manifest declares one datatype and a table of files:
//!
//! ```json
//! {
//!   "data_type": "movie",
//!   "files": {
//!     ".": { "genre": ["Horror", "Sci-Fi"], "year": ["1979"] }
//!   }
//! }
//! ```
//!
//! The key `"."` addresses the directory holding the manifest; any other key
//! names a file relative to it.

use serde::Deserialize;
use stagfs_core::{LoadError, ManifestEntry, ManifestValue};
use std::collections::BTreeMap;
use std::path::Path;

/// Key addressing the manifest's own directory.
pub const SELF_TARGET: &str = ".";

/// Parsed manifest, generic over the format's value type.
#[derive(Debug, Deserialize)]
pub struct ManifestDocument<V> {
    pub data_type: String,
    pub files: BTreeMap<String, V>,
}

/// Format-specific values that decode into a [`ManifestValue`].
pub trait IntoManifestValue {
    fn into_manifest_value(self) -> ManifestValue;
}

impl<V: IntoManifestValue> ManifestDocument<V> {
    /// Resolve targets against the directory of `source` and convert values.
    pub fn into_entries(self, source: &Path) -> Result<Vec<ManifestEntry>, LoadError> {
        if self.data_type.is_empty() {
            return Err(LoadError::Parse("`data_type` must not be empty".to_string()));
        }

        let source = std::path::absolute(source)?;
        let base = source.parent().unwrap_or(Path::new("/"));

        Ok(self
            .files
            .into_iter()
            .map(|(name, value)| ManifestEntry {
                datatype: self.data_type.clone(),
                target: if name == SELF_TARGET {
                    base.to_path_buf()
                } else {
                    base.join(name)
                },
                value: value.into_manifest_value(),
            })
            .collect())
    }
}

/// Scalar text of a list element; nested structures inside lists are ignored.
fn json_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl IntoManifestValue for serde_json::Value {
    fn into_manifest_value(self) -> ManifestValue {
        match self {
            Self::Null => ManifestValue::Null,
            Self::Array(items) => ManifestValue::List(items.iter().filter_map(json_scalar).collect()),
            Self::Object(map) => ManifestValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_manifest_value()))
                    .collect(),
            ),
            scalar => ManifestValue::Scalar(json_scalar(&scalar).unwrap_or_default()),
        }
    }
}

fn toml_scalar(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

impl IntoManifestValue for toml::Value {
    fn into_manifest_value(self) -> ManifestValue {
        match self {
            Self::Array(items) => ManifestValue::List(items.iter().filter_map(toml_scalar).collect()),
            Self::Table(table) => ManifestValue::Map(
                table
                    .into_iter()
                    .map(|(k, v)| (k, v.into_manifest_value()))
                    .collect(),
            ),
            scalar => ManifestValue::Scalar(toml_scalar(&scalar).unwrap_or_default()),
        }
    }
}
