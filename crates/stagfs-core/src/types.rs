//! Core types for StagFS.
//!
//! ## Tag forest
//! - [`TagNode`]: A persisted node (directory tag or file reference)
//! - [`ChildEntry`]: One entry of a directory listing
//! - [`ChildRef`]: Result of a single-step lookup
//! - [`StoreStats`]: Forest statistics
//!
//! ## Manifests
//! - [`ManifestValue`]: Decoded nested tag structure
//! - [`ManifestEntry`]: One top-level file entry of a manifest
//! - [`Mutation`]: A planned forest mutation
//!
//! ## Resolution and sync
//! - [`Resolved`]: What a virtual path currently means
//! - [`WatchEvent`]: Filesystem change notifications
//! - [`IngestStats`]: Ingestion counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Identifier of a node in the tag forest.
pub type NodeId = i64;

// ============================================================================
// Tag forest
// ============================================================================

/// A node of the tag forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagNode {
    /// Unique, monotonically assigned identifier
    pub id: NodeId,
    /// Forest namespace, e.g. "movie"
    pub datatype: String,
    /// Parent node; `None` for forest roots
    pub parent: Option<NodeId>,
    /// Path component
    pub name: String,
    /// Absolute path of the file this node stands for (`None` for tags)
    pub backing_path: Option<PathBuf>,
    /// Manifest that created this reference; empty for tags, which are
    /// shared between manifests
    pub origin: PathBuf,
}

impl TagNode {
    /// Whether this node denotes a concrete file.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.backing_path
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty())
    }
}

/// An immediate child of a directory node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub name: String,
    pub backing_path: Option<PathBuf>,
}

impl ChildEntry {
    /// A child that is itself a tag directory.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backing_path: None,
        }
    }

    /// A child that references a real file.
    pub fn reference(name: impl Into<String>, backing_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            backing_path: Some(backing_path.into()),
        }
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.backing_path.is_some()
    }
}

/// Result of resolving one path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub id: NodeId,
    pub backing_path: Option<PathBuf>,
}

/// Tag store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total nodes in the forest
    pub total_nodes: u64,
    /// Nodes without a backing path
    pub directories: u64,
    /// Nodes referencing a real file
    pub references: u64,
    /// Distinct root datatypes
    pub datatypes: u64,
    /// Distinct manifests that own nodes
    pub origins: u64,
}

/// Counters produced by applying one mutation plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub tags: usize,
    pub references: usize,
}

// ============================================================================
// Manifests
// ============================================================================

/// Nested tag structure of a manifest file entry.
///
/// The shape decides the mutation: a `Map` creates one tag per key and
/// recurses, a `List` tags the file with every element, a `Scalar` registers
/// the file directly under the current tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestValue {
    Map(Vec<(String, ManifestValue)>),
    List(Vec<String>),
    Scalar(String),
    /// Carries no mutation
    Null,
}

impl ManifestValue {
    /// Translate this value into forest mutations for `target`.
    #[must_use]
    pub fn plan(&self, target: &Path) -> Vec<Mutation> {
        let mut out = Vec::new();
        self.plan_into(&mut Vec::new(), target, &mut out);
        out
    }

    fn plan_into(&self, prefix: &mut Vec<String>, target: &Path, out: &mut Vec<Mutation>) {
        match self {
            Self::Map(entries) => {
                for (key, value) in entries {
                    prefix.push(key.clone());
                    out.push(Mutation::Tag {
                        path: prefix.clone(),
                    });
                    value.plan_into(prefix, target, out);
                    prefix.pop();
                }
            }
            Self::List(tags) => {
                let mut seen = HashSet::new();
                for tag in tags.iter().filter(|t| seen.insert(t.as_str())) {
                    let mut path = prefix.clone();
                    path.push(tag.clone());
                    out.push(Mutation::Reference {
                        path,
                        target: target.to_path_buf(),
                    });
                }
            }
            Self::Scalar(_) => out.push(Mutation::Reference {
                path: prefix.clone(),
                target: target.to_path_buf(),
            }),
            Self::Null => {}
        }
    }
}

/// One top-level file entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Forest namespace declared by the manifest
    pub datatype: String,
    /// Absolute path of the tagged file or directory
    pub target: PathBuf,
    /// Tags for the target
    pub value: ManifestValue,
}

/// A planned forest mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Ensure every tag along `path` exists
    Tag { path: Vec<String> },
    /// Ensure the tags along `path` exist and register `target` below them
    Reference { path: Vec<String>, target: PathBuf },
}

impl Mutation {
    /// Tag path this mutation walks.
    #[must_use]
    pub fn path(&self) -> &[String] {
        match self {
            Self::Tag { path } | Self::Reference { path, .. } => path,
        }
    }
}

/// Name under which a referenced file is listed.
#[must_use]
pub fn reference_name(target: &Path) -> String {
    target.file_name().map_or_else(
        || target.to_string_lossy().into_owned(),
        |n| n.to_string_lossy().into_owned(),
    )
}

/// Outcome of loading one manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    /// Entries committed
    pub entries: usize,
    /// Entries whose target does not exist
    pub skipped: usize,
    /// Entries whose commit failed
    pub failed: usize,
    pub tags: usize,
    pub references: usize,
}

// ============================================================================
// Resolution
// ============================================================================

/// What a virtual path resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Resolved {
    /// A tag directory and its children
    Directory(Vec<ChildEntry>),
    /// A concrete backing file or directory
    File(PathBuf),
}

impl Resolved {
    /// Child names of a directory; empty for files.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::Directory(entries) => entries.iter().map(|e| e.name.as_str()).collect(),
            Self::File(_) => Vec::new(),
        }
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }
}

// ============================================================================
// Sync
// ============================================================================

/// Filesystem change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    MovedIn(PathBuf),
    MovedOut(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Ingestion statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub manifests_loaded: u64,
    pub manifests_removed: u64,
    pub errors: u64,
    pub last_update: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> PathBuf {
        PathBuf::from("/media/Alien (1979)")
    }

    #[test]
    fn test_plan_map_of_list() {
        let value = ManifestValue::Map(vec![(
            "genre".to_string(),
            ManifestValue::List(vec!["Horror".to_string(), "Sci-Fi".to_string()]),
        )]);

        let plan = value.plan(&target());
        assert_eq!(
            plan,
            vec![
                Mutation::Tag {
                    path: vec!["genre".to_string()]
                },
                Mutation::Reference {
                    path: vec!["genre".to_string(), "Horror".to_string()],
                    target: target(),
                },
                Mutation::Reference {
                    path: vec!["genre".to_string(), "Sci-Fi".to_string()],
                    target: target(),
                },
            ]
        );
    }

    #[test]
    fn test_plan_list_duplicates_collapse() {
        let value = ManifestValue::List(vec![
            "Horror".to_string(),
            "Horror".to_string(),
            "Comedy".to_string(),
        ]);
        let plan = value.plan(&target());
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].path(), ["Horror".to_string()]);
        assert_eq!(plan[1].path(), ["Comedy".to_string()]);
    }

    #[test]
    fn test_plan_scalar_registers_under_current_tag() {
        let value = ManifestValue::Map(vec![(
            "title".to_string(),
            ManifestValue::Scalar("Alien".to_string()),
        )]);
        let plan = value.plan(&target());
        assert_eq!(
            plan[1],
            Mutation::Reference {
                path: vec!["title".to_string()],
                target: target(),
            }
        );
    }

    #[test]
    fn test_plan_nested_maps() {
        let value = ManifestValue::Map(vec![(
            "rating".to_string(),
            ManifestValue::Map(vec![(
                "range".to_string(),
                ManifestValue::List(vec!["8-9".to_string()]),
            )]),
        )]);
        let plan = value.plan(&target());
        assert_eq!(plan.len(), 3);
        assert_eq!(
            plan[2].path(),
            ["rating".to_string(), "range".to_string(), "8-9".to_string()]
        );
    }

    #[test]
    fn test_plan_null_creates_only_tag() {
        let value = ManifestValue::Map(vec![("keywords".to_string(), ManifestValue::Null)]);
        let plan = value.plan(&target());
        assert_eq!(
            plan,
            vec![Mutation::Tag {
                path: vec!["keywords".to_string()]
            }]
        );
    }

    #[test]
    fn test_reference_name_uses_basename() {
        assert_eq!(reference_name(Path::new("/media/X")), "X");
        assert_eq!(reference_name(Path::new("/media/a.mkv")), "a.mkv");
        assert_eq!(reference_name(Path::new("/")), "/");
    }

    #[test]
    fn test_tag_node_is_reference() {
        let mut node = TagNode {
            id: 1,
            datatype: "movie".to_string(),
            parent: None,
            name: "genre".to_string(),
            backing_path: None,
            origin: PathBuf::from("/media/X/movie.stag"),
        };
        assert!(!node.is_reference());

        node.backing_path = Some(PathBuf::new());
        assert!(!node.is_reference());

        node.backing_path = Some(PathBuf::from("/media/X"));
        assert!(node.is_reference());
    }

    #[test]
    fn test_resolved_names() {
        let resolved = Resolved::Directory(vec![
            ChildEntry::directory("Horror"),
            ChildEntry::reference("X", "/media/X"),
        ]);
        assert_eq!(resolved.names(), vec!["Horror", "X"]);
        assert!(resolved.is_directory());

        let file = Resolved::File(PathBuf::from("/media/X"));
        assert!(file.names().is_empty());
        assert!(!file.is_directory());
    }
}
