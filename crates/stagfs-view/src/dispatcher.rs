//! Top-level path dispatch.

use stagfs_core::{ChildEntry, Resolved, TagStore, ViewError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::view::{TagView, View};

/// Split off the first segment of a virtual path.
///
/// The remainder keeps its leading `/` and is otherwise untouched; `"/"`
/// stands for an empty remainder.
fn split_first_segment(path: &str) -> Option<(&str, &str)> {
    let mut rest = path;
    loop {
        rest = rest.trim_start_matches('/');
        match rest.strip_prefix('.') {
            Some("") => return None,
            Some(after) if after.starts_with('/') => rest = after,
            _ => break,
        }
    }

    if rest.is_empty() {
        return None;
    }
    Some(match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    })
}

/// Routes a virtual path to the view owning its first segment.
///
/// The first segment names either a custom view or a datatype. Datatype
/// views are created on first use and cached while the datatype exists.
pub struct ViewDispatcher {
    store: Arc<dyn TagStore>,
    /// Custom views by name
    custom: HashMap<String, Arc<dyn View>>,
    /// Lazily created datatype views
    cache: RwLock<HashMap<String, Arc<dyn View>>>,
}

impl ViewDispatcher {
    pub fn new(store: Arc<dyn TagStore>) -> Self {
        Self {
            store,
            custom: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a custom view under its own name.
    ///
    /// The view receives the raw residual path and shadows any datatype of
    /// the same name.
    pub fn register(&mut self, view: Arc<dyn View>) {
        debug!("Registered custom view {}", view.name());
        self.custom.insert(view.name().to_string(), view);
    }

    /// The store this dispatcher reads.
    pub fn store(&self) -> &Arc<dyn TagStore> {
        &self.store
    }

    /// Number of cached datatype views.
    pub async fn cached_views(&self) -> usize {
        self.cache.read().await.len()
    }

    /// View responsible for a top-level name.
    ///
    /// Fails with [`ViewError::NotFound`] when `name` is neither a custom
    /// view nor a datatype in the store. Views of datatypes that have
    /// disappeared are dropped on the way.
    pub async fn get_view(&self, name: &str) -> Result<Arc<dyn View>, ViewError> {
        if let Some(view) = self.custom.get(name) {
            return Ok(Arc::clone(view));
        }

        let datatypes = self.store.list_datatypes().await?;
        if !datatypes.iter().any(|d| d == name) {
            let mut cache = self.cache.write().await;
            cache.retain(|cached, _| datatypes.contains(cached));
            return Err(ViewError::NotFound(format!("/{name}")));
        }

        if let Some(view) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(view));
        }

        let mut cache = self.cache.write().await;
        Ok(Arc::clone(cache.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating view for datatype {}", name);
            Arc::new(TagView::new(name, Arc::clone(&self.store)))
        })))
    }

    /// Entries of the virtual root: datatypes and custom views.
    pub async fn list_root(&self) -> Result<Vec<ChildEntry>, ViewError> {
        let datatypes = self.store.list_datatypes().await?;
        let names: BTreeSet<&str> = datatypes
            .iter()
            .map(String::as_str)
            .chain(self.custom.keys().map(String::as_str))
            .collect();
        Ok(names.into_iter().map(ChildEntry::directory).collect())
    }

    /// Resolve a virtual path to a directory listing or a backing file.
    pub async fn resolve(&self, path: &str) -> Result<Resolved, ViewError> {
        let Some((first, residual)) = split_first_segment(path) else {
            return Ok(Resolved::Directory(self.list_root().await?));
        };
        self.get_view(first).await?.resolve(residual).await
    }
}
