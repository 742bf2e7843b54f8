//! Stagfile loaders.
//!
//! `*.stag` manifests are JSON documents; `*.stag.toml` manifests carry the
//! same structure in TOML.

use async_trait::async_trait;
use stagfs_core::{LoadError, ManifestEntry, ManifestLoader};
use std::path::Path;
use tracing::debug;

use crate::manifest::ManifestDocument;

/// Loader for JSON `*.stag` manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagfileLoader;

impl StagfileLoader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ManifestLoader for StagfileLoader {
    fn name(&self) -> &str {
        "json"
    }

    fn suffixes(&self) -> &[&str] {
        &["stag"]
    }

    async fn read_entries(&self, source: &Path) -> Result<Vec<ManifestEntry>, LoadError> {
        let text = tokio::fs::read_to_string(source).await?;
        let doc: ManifestDocument<serde_json::Value> =
            serde_json::from_str(&text).map_err(|e| LoadError::Parse(e.to_string()))?;
        debug!(
            "Read {} entries of type {} from {:?}",
            doc.files.len(),
            doc.data_type,
            source
        );
        doc.into_entries(source)
    }
}

/// Loader for TOML `*.stag.toml` manifests.
///
/// ```toml
/// data_type = "movie"
///
/// [files."."]
/// genre = ["Horror", "Sci-Fi"]
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlStagfileLoader;

impl TomlStagfileLoader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ManifestLoader for TomlStagfileLoader {
    fn name(&self) -> &str {
        "toml"
    }

    fn suffixes(&self) -> &[&str] {
        &["stag.toml"]
    }

    async fn read_entries(&self, source: &Path) -> Result<Vec<ManifestEntry>, LoadError> {
        let text = tokio::fs::read_to_string(source).await?;
        let doc: ManifestDocument<toml::Value> =
            toml::from_str(&text).map_err(|e| LoadError::Parse(e.to_string()))?;
        doc.into_entries(source)
    }
}
