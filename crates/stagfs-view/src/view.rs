//! Views: resolvers for the path below a datatype.

use async_trait::async_trait;
use stagfs_core::{Resolved, StoreError, TagStore, ViewError};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Split a virtual path into its non-empty segments.
#[must_use]
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

/// Resolver for everything below one top-level directory.
#[async_trait]
pub trait View: Send + Sync {
    /// Top-level directory name this view answers for.
    fn name(&self) -> &str;

    /// Resolve the residual path (`"/"` for the view's own root).
    async fn resolve(&self, residual: &str) -> Result<Resolved, ViewError>;
}

/// Default view: walks the tag forest of one datatype.
pub struct TagView {
    datatype: String,
    store: Arc<dyn TagStore>,
}

impl TagView {
    pub fn new(datatype: impl Into<String>, store: Arc<dyn TagStore>) -> Self {
        Self {
            datatype: datatype.into(),
            store,
        }
    }

    fn not_found(&self, residual: &str) -> ViewError {
        ViewError::NotFound(format!("/{}{}", self.datatype, residual))
    }
}

#[async_trait]
impl View for TagView {
    fn name(&self) -> &str {
        &self.datatype
    }

    async fn resolve(&self, residual: &str) -> Result<Resolved, ViewError> {
        let segments = split_path(residual);
        let mut parent = None;

        for (i, segment) in segments.iter().enumerate() {
            let child = match self
                .store
                .lookup_child(&self.datatype, parent, segment)
                .await
            {
                Ok(child) => child,
                Err(StoreError::NotFound(_)) => return Err(self.not_found(residual)),
                Err(e) => return Err(e.into()),
            };

            if let Some(backing) = child.backing_path {
                return passthrough(backing, &segments[i + 1..])
                    .ok_or_else(|| self.not_found(residual));
            }
            parent = Some(child.id);
        }

        let children = self.store.children(&self.datatype, parent).await?;
        if parent.is_none() && children.is_empty() {
            return Err(self.not_found(residual));
        }
        trace!("{} children at /{}{}", children.len(), self.datatype, residual);
        Ok(Resolved::Directory(children))
    }
}

/// Resolve segments remaining below a leaf inside its backing path.
fn passthrough(backing: PathBuf, rest: &[&str]) -> Option<Resolved> {
    if rest.is_empty() {
        return Some(Resolved::File(backing));
    }

    let mut path = backing;
    for segment in rest {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            _ => return None,
        }
    }

    path.symlink_metadata().ok().map(|_| Resolved::File(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagfs_core::{ChildEntry, ManifestValue};
    use stagfs_store::MemoryStore;
    use tempfile::tempdir;

    async fn movie_store(target: &Path) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let value = ManifestValue::Map(vec![(
            "genre".to_string(),
            ManifestValue::List(vec!["Horror".to_string(), "Sci-Fi".to_string()]),
        )]);
        store
            .apply(
                "movie",
                &target.join("movie.stag"),
                &value.plan(target),
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_split_path() {
        assert!(split_path("/").is_empty());
        assert!(split_path("").is_empty());
        assert_eq!(split_path("/movie//genre/./Horror/"), vec!["movie", "genre", "Horror"]);
    }

    #[tokio::test]
    async fn test_resolve_root_lists_top_tags() {
        let store = movie_store(Path::new("/media/Alien")).await;
        let view = TagView::new("movie", store);

        let resolved = view.resolve("/").await.unwrap();
        assert_eq!(resolved, Resolved::Directory(vec![ChildEntry::directory("genre")]));
    }

    #[tokio::test]
    async fn test_resolve_directory_and_leaf() {
        let store = movie_store(Path::new("/media/Alien")).await;
        let view = TagView::new("movie", store);

        let resolved = view.resolve("/genre").await.unwrap();
        assert_eq!(resolved.names(), vec!["Horror", "Sci-Fi"]);

        let resolved = view.resolve("/genre/Horror/Alien").await.unwrap();
        assert_eq!(resolved, Resolved::File(PathBuf::from("/media/Alien")));
    }

    #[tokio::test]
    async fn test_resolve_miss_is_not_found() {
        let store = movie_store(Path::new("/media/Alien")).await;
        let view = TagView::new("movie", store);

        let err = view.resolve("/genre/Western").await.unwrap_err();
        match err {
            ViewError::NotFound(path) => assert_eq!(path, "/movie/genre/Western"),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_unknown_datatype_is_not_found() {
        let store = movie_store(Path::new("/media/Alien")).await;
        let view = TagView::new("music", store);
        assert!(matches!(view.resolve("/").await, Err(ViewError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_passthrough_below_leaf() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("Alien");
        std::fs::create_dir_all(target.join("extras")).unwrap();
        std::fs::write(target.join("extras/trailer.mkv"), b"x").unwrap();

        let store = movie_store(&target).await;
        let view = TagView::new("movie", store);

        let resolved = view
            .resolve("/genre/Horror/Alien/extras/trailer.mkv")
            .await
            .unwrap();
        assert_eq!(resolved, Resolved::File(target.join("extras/trailer.mkv")));

        let missing = view.resolve("/genre/Horror/Alien/extras/nope.mkv").await;
        assert!(matches!(missing, Err(ViewError::NotFound(_))));

        let escape = view.resolve("/genre/Horror/Alien/../Alien").await;
        assert!(matches!(escape, Err(ViewError::NotFound(_))));
    }
}
