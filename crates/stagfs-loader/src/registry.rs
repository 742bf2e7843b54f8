//! Loader registry for routing manifest files to their format.

use stagfs_core::{LoadError, LoadSummary, ManifestLoader, TagStore, has_suffix};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::{StagfileLoader, TomlStagfileLoader};

/// Registry of manifest loaders.
pub struct LoaderRegistry {
    /// Named loaders
    loaders: HashMap<String, Arc<dyn ManifestLoader>>,
    /// File-name suffix to loader name mapping
    suffix_mapping: HashMap<String, String>,
}

impl LoaderRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
            suffix_mapping: HashMap::new(),
        }
    }

    /// Registry with the JSON and TOML stagfile loaders.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(StagfileLoader::new());
        registry.register(TomlStagfileLoader::new());
        registry
    }

    /// Register a loader under its own name.
    pub fn register<L: ManifestLoader + 'static>(&mut self, loader: L) {
        let loader = Arc::new(loader);
        for suffix in loader.suffixes() {
            self.suffix_mapping
                .insert((*suffix).to_string(), loader.name().to_string());
        }
        self.loaders.insert(loader.name().to_string(), loader);
    }

    /// Route files ending in `.suffix` to the loader called `name`.
    pub fn map_suffix(&mut self, suffix: &str, name: &str) -> Result<(), LoadError> {
        if !self.loaders.contains_key(name) {
            return Err(LoadError::UnsupportedType(format!(
                "unknown loader `{name}` for suffix `{suffix}`"
            )));
        }
        self.suffix_mapping
            .insert(suffix.trim_start_matches('.').to_string(), name.to_string());
        Ok(())
    }

    /// Get the loader for a file. The longest matching suffix wins.
    #[must_use]
    pub fn get_for_path(&self, path: &Path) -> Option<Arc<dyn ManifestLoader>> {
        let name = path.file_name()?.to_str()?;
        self.suffix_mapping
            .iter()
            .filter(|(suffix, _)| has_suffix(name, suffix))
            .max_by_key(|(suffix, _)| suffix.len())
            .and_then(|(_, loader)| self.loaders.get(loader))
            .cloned()
    }

    /// Whether some loader handles this file.
    #[must_use]
    pub fn is_manifest(&self, path: &Path) -> bool {
        self.get_for_path(path).is_some()
    }

    /// Load a manifest into `store`.
    pub async fn load(&self, store: &dyn TagStore, path: &Path) -> Result<LoadSummary, LoadError> {
        let loader = self
            .get_for_path(path)
            .ok_or_else(|| LoadError::UnsupportedType(path.display().to_string()))?;

        loader.load(store, path).await
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagfs_core::TagStore;
    use stagfs_store::MemoryStore;
    use tempfile::tempdir;

    #[test]
    fn test_new_registry_is_empty() {
        let registry = LoaderRegistry::new();
        assert!(registry.loaders.is_empty());
        assert!(registry.suffix_mapping.is_empty());
    }

    #[test]
    fn test_defaults_route_by_suffix() {
        let registry = LoaderRegistry::with_defaults();

        let json = registry.get_for_path(Path::new("/m/movie.stag")).unwrap();
        assert_eq!(json.name(), "json");

        let toml = registry
            .get_for_path(Path::new("/m/movie.stag.toml"))
            .unwrap();
        assert_eq!(toml.name(), "toml");

        assert!(registry.get_for_path(Path::new("/m/movie.mkv")).is_none());
        assert!(!registry.is_manifest(Path::new("/m/stag")));
    }

    #[test]
    fn test_map_suffix() {
        let mut registry = LoaderRegistry::with_defaults();
        registry.map_suffix(".tags", "toml").unwrap();

        let loader = registry.get_for_path(Path::new("/m/album.tags")).unwrap();
        assert_eq!(loader.name(), "toml");
    }

    #[test]
    fn test_map_suffix_unknown_loader() {
        let mut registry = LoaderRegistry::with_defaults();
        let err = registry.map_suffix("yaml", "yaml").unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedType(_)));
    }

    #[tokio::test]
    async fn test_load_unsupported_type() {
        let registry = LoaderRegistry::with_defaults();
        let store = MemoryStore::new();

        let result = registry.load(&store, Path::new("/m/notes.txt")).await;
        match result.unwrap_err() {
            LoadError::UnsupportedType(path) => assert_eq!(path, "/m/notes.txt"),
            other => panic!("Expected UnsupportedType error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_routes_to_loader() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("movie.stag");
        std::fs::write(
            &source,
            r#"{"data_type": "movie", "files": {".": {"genre": ["Western"]}}}"#,
        )
        .unwrap();

        let registry = LoaderRegistry::default();
        let store = MemoryStore::new();
        let summary = registry.load(&store, &source).await.unwrap();

        assert_eq!(summary.entries, 1);
        assert_eq!(store.list_datatypes().await.unwrap(), vec!["movie"]);
    }
}
