//! Core traits for StagFS components.
//!
//! - [`TagStore`]: Persist and query the tag forest
//! - [`ManifestLoader`]: Turn a manifest file into forest mutations
//!
//! Storage backends and manifest formats are swappable behind these traits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{LoadError, StoreError};
use crate::types::{
    ApplyStats, ChildEntry, ChildRef, LoadSummary, ManifestEntry, Mutation, NodeId, StoreStats,
    reference_name,
};

// ============================================================================
// Tag Storage
// ============================================================================

/// Trait for tag forest storage.
///
/// Tags are unique per `(datatype, parent, name)`; references are unique per
/// `(datatype, parent, backing path)` and are listed under the basename of
/// their backing path.
///
/// Only references belong to a manifest. Tags carry no origin, so removing a
/// manifest never takes away a directory other manifests' references sit in.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Initialize the store (create schema if needed).
    async fn init(&self) -> Result<(), StoreError>;

    /// Return the tag `name` under `parent`, creating it if absent.
    ///
    /// `origin` is the manifest asking; it is not recorded on the tag.
    async fn get_or_create_tag(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        name: &str,
        origin: &Path,
    ) -> Result<NodeId, StoreError>;

    /// Return the reference to `backing_path` under `parent`, creating it if absent.
    async fn get_or_create_reference(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        backing_path: &Path,
        origin: &Path,
    ) -> Result<NodeId, StoreError>;

    /// List the immediate children of `parent` in creation order.
    async fn children(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
    ) -> Result<Vec<ChildEntry>, StoreError>;

    /// Resolve a single path segment. Fails with [`StoreError::NotFound`].
    async fn lookup_child(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        name: &str,
    ) -> Result<ChildRef, StoreError>;

    /// Distinct datatypes that have at least one root node.
    async fn list_datatypes(&self) -> Result<Vec<String>, StoreError>;

    /// Remove every reference created by `origin`. Returns the number removed.
    ///
    /// Tags left empty stay in place.
    async fn delete_by_origin(&self, origin: &Path) -> Result<u64, StoreError>;

    /// Distinct manifests owning at least one reference.
    async fn list_origins(&self) -> Result<Vec<PathBuf>, StoreError>;

    /// Remove every node.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Get store statistics.
    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Apply a mutation plan for one manifest entry.
    ///
    /// Backends that support transactions override this so that an entry is
    /// committed as a unit.
    async fn apply(
        &self,
        datatype: &str,
        origin: &Path,
        mutations: &[Mutation],
    ) -> Result<ApplyStats, StoreError> {
        let mut resolved: HashMap<Vec<String>, NodeId> = HashMap::new();
        let mut stats = ApplyStats::default();

        for mutation in mutations {
            let mut parent = None;
            for depth in 1..=mutation.path().len() {
                let prefix = &mutation.path()[..depth];
                let id = match resolved.get(prefix) {
                    Some(id) => *id,
                    None => {
                        let id = self
                            .get_or_create_tag(datatype, parent, &prefix[depth - 1], origin)
                            .await?;
                        resolved.insert(prefix.to_vec(), id);
                        id
                    }
                };
                parent = Some(id);
            }

            match mutation {
                Mutation::Tag { .. } => stats.tags += 1,
                Mutation::Reference { target, .. } => {
                    self.get_or_create_reference(datatype, parent, target, origin)
                        .await?;
                    stats.references += 1;
                }
            }
        }

        Ok(stats)
    }
}

// ============================================================================
// Manifest Loading
// ============================================================================

/// Trait for manifest formats.
#[async_trait]
pub trait ManifestLoader: Send + Sync {
    /// Name of this loader.
    fn name(&self) -> &str;

    /// File-name suffixes (without the leading dot) this loader handles.
    fn suffixes(&self) -> &[&str];

    /// Check if this loader handles the given file.
    fn can_load(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.suffixes().iter().any(|s| has_suffix(name, s)))
    }

    /// Parse a manifest into its file entries.
    ///
    /// Targets are resolved to absolute paths relative to the manifest's
    /// directory; existence is not checked here.
    async fn read_entries(&self, source: &Path) -> Result<Vec<ManifestEntry>, LoadError>;

    /// Parse `source` and commit every entry into `store`.
    async fn load(&self, store: &dyn TagStore, source: &Path) -> Result<LoadSummary, LoadError> {
        let entries = self.read_entries(source).await?;
        Ok(self.commit(store, source, entries).await)
    }

    /// Commit parsed entries into `store` with `source` as their origin.
    ///
    /// Entries whose target does not exist are skipped. A failed commit is
    /// logged and does not abort the remaining entries.
    async fn commit(
        &self,
        store: &dyn TagStore,
        source: &Path,
        entries: Vec<ManifestEntry>,
    ) -> LoadSummary {
        let mut summary = LoadSummary::default();

        for entry in entries {
            if !entry.target.exists() {
                debug!("Skipping missing target {:?} in {:?}", entry.target, source);
                summary.skipped += 1;
                continue;
            }

            let mutations = entry.value.plan(&entry.target);
            match store.apply(&entry.datatype, source, &mutations).await {
                Ok(stats) => {
                    summary.entries += 1;
                    summary.tags += stats.tags;
                    summary.references += stats.references;
                }
                Err(e) => {
                    warn!(
                        "Failed to commit {} from {:?}: {}",
                        reference_name(&entry.target),
                        source,
                        e
                    );
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

/// Whether `name` ends in `.suffix` (or is exactly `.suffix`).
#[must_use]
pub fn has_suffix(name: &str, suffix: &str) -> bool {
    name.strip_suffix(suffix)
        .is_some_and(|stem| stem.ends_with('.'))
}
