//! In-memory tag store.
//!
//! This module provides a [`MemoryStore`] that keeps the forest in an arena.
//! It's useful for:
//! - Tests that don't need persistence
//! - Mounts started with `store.backend = "memory"`, which rebuild the forest
//!   from a full scan on every start

use async_trait::async_trait;
use stagfs_core::{
    ChildEntry, ChildRef, NodeId, StoreError, StoreStats, TagNode, TagStore, reference_name,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

type SiblingKey = (String, Option<NodeId>);

#[derive(Default)]
struct Forest {
    nodes: BTreeMap<NodeId, TagNode>,
    /// Children of each `(datatype, parent)` in creation order
    siblings: HashMap<SiblingKey, Vec<NodeId>>,
    next_id: NodeId,
}

impl Forest {
    fn siblings(&self, datatype: &str, parent: Option<NodeId>) -> impl Iterator<Item = &TagNode> {
        self.siblings
            .get(&(datatype.to_string(), parent))
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    fn insert(
        &mut self,
        datatype: &str,
        parent: Option<NodeId>,
        name: String,
        backing_path: Option<PathBuf>,
        origin: &Path,
    ) -> NodeId {
        self.next_id += 1;
        let id = self.next_id;
        self.nodes.insert(
            id,
            TagNode {
                id,
                datatype: datatype.to_string(),
                parent,
                name,
                backing_path,
                origin: origin.to_path_buf(),
            },
        );
        self.siblings
            .entry((datatype.to_string(), parent))
            .or_default()
            .push(id);
        id
    }
}

/// In-memory tag store.
///
/// Ids are assigned monotonically and never reused, even after
/// [`TagStore::clear`].
///
/// # Example
///
/// ```rust
/// use stagfs_store::MemoryStore;
/// use stagfs_core::TagStore;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::new();
/// store.init().await?;
///
/// let genre = store
///     .get_or_create_tag("movie", None, "genre", Path::new("/media/movie.stag"))
///     .await?;
/// assert_eq!(store.lookup_child("movie", None, "genre").await?.id, genre);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    forest: Arc<RwLock<Forest>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every node, ordered by id.
    pub async fn nodes(&self) -> Vec<TagNode> {
        self.forest.read().await.nodes.values().cloned().collect()
    }
}

#[async_trait]
impl TagStore for MemoryStore {
    async fn init(&self) -> Result<(), StoreError> {
        debug!("MemoryStore initialized");
        Ok(())
    }

    async fn get_or_create_tag(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        name: &str,
        origin: &Path,
    ) -> Result<NodeId, StoreError> {
        let mut forest = self.forest.write().await;
        if let Some(node) = forest
            .siblings(datatype, parent)
            .find(|n| !n.is_reference() && n.name == name)
        {
            return Ok(node.id);
        }
        trace!("Tag {}/{} first asserted by {:?}", datatype, name, origin);
        // Tags are shared between manifests and carry no origin
        Ok(forest.insert(datatype, parent, name.to_string(), None, Path::new("")))
    }

    async fn get_or_create_reference(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        backing_path: &Path,
        origin: &Path,
    ) -> Result<NodeId, StoreError> {
        let name = reference_name(backing_path);
        let mut forest = self.forest.write().await;
        if let Some(node) = forest.siblings(datatype, parent).find(|n| {
            n.is_reference()
                && (n.backing_path.as_deref() == Some(backing_path) || n.name == name)
        }) {
            return Ok(node.id);
        }
        Ok(forest.insert(
            datatype,
            parent,
            name,
            Some(backing_path.to_path_buf()),
            origin,
        ))
    }

    async fn children(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
    ) -> Result<Vec<ChildEntry>, StoreError> {
        let forest = self.forest.read().await;
        Ok(forest
            .siblings(datatype, parent)
            .map(|n| ChildEntry {
                name: n.name.clone(),
                backing_path: n.backing_path.clone(),
            })
            .collect())
    }

    async fn lookup_child(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        name: &str,
    ) -> Result<ChildRef, StoreError> {
        let forest = self.forest.read().await;
        forest
            .siblings(datatype, parent)
            .find(|n| n.name == name)
            .map(|n| ChildRef {
                id: n.id,
                backing_path: n.backing_path.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list_datatypes(&self) -> Result<Vec<String>, StoreError> {
        let forest = self.forest.read().await;
        let datatypes: BTreeSet<&str> = forest
            .siblings
            .iter()
            .filter(|((_, parent), ids)| parent.is_none() && !ids.is_empty())
            .map(|((datatype, _), _)| datatype.as_str())
            .collect();
        Ok(datatypes.into_iter().map(str::to_string).collect())
    }

    async fn delete_by_origin(&self, origin: &Path) -> Result<u64, StoreError> {
        let mut forest = self.forest.write().await;

        let doomed: Vec<NodeId> = forest
            .nodes
            .values()
            .filter(|n| n.origin == origin)
            .map(|n| n.id)
            .collect();

        for id in &doomed {
            if let Some(node) = forest.nodes.remove(id) {
                let key = (node.datatype, node.parent);
                if let Some(ids) = forest.siblings.get_mut(&key) {
                    ids.retain(|sibling| sibling != id);
                    if ids.is_empty() {
                        forest.siblings.remove(&key);
                    }
                }
            }
        }

        debug!("Deleted {} nodes from {:?}", doomed.len(), origin);
        Ok(doomed.len() as u64)
    }

    async fn list_origins(&self) -> Result<Vec<PathBuf>, StoreError> {
        let forest = self.forest.read().await;
        let origins: BTreeSet<&Path> = forest
            .nodes
            .values()
            .map(|n| n.origin.as_path())
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        Ok(origins.into_iter().map(Path::to_path_buf).collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut forest = self.forest.write().await;
        forest.nodes.clear();
        forest.siblings.clear();
        debug!("Cleared tag store");
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let forest = self.forest.read().await;
        let references = forest.nodes.values().filter(|n| n.is_reference()).count() as u64;
        let total = forest.nodes.len() as u64;
        let datatypes: BTreeSet<&str> = forest
            .nodes
            .values()
            .filter(|n| n.parent.is_none())
            .map(|n| n.datatype.as_str())
            .collect();
        let origins: BTreeSet<&Path> = forest
            .nodes
            .values()
            .map(|n| n.origin.as_path())
            .filter(|p| !p.as_os_str().is_empty())
            .collect();

        Ok(StoreStats {
            total_nodes: total,
            directories: total - references,
            references,
            datatypes: datatypes.len() as u64,
            origins: origins.len() as u64,
        })
    }
}
