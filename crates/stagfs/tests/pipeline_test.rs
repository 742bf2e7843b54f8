//! Integration tests for the full StagFS pipeline.
//!
//! Tests the complete flow: manifest → loader → tag store → dispatcher.

use stagfs_core::{ChildEntry, Resolved, TagStore, ViewError, WatchEvent};
use stagfs_index::{IngestConfig, IngestionManager};
use stagfs_loader::LoaderRegistry;
use stagfs_store::{MemoryStore, SqliteStore};
use stagfs_view::ViewDispatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn write(path: &Path, body: &str) -> PathBuf {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    path.to_path_buf()
}

fn movie_manifest(genres: &[&str]) -> String {
    let list: Vec<String> = genres.iter().map(|g| format!("\"{g}\"")).collect();
    format!(
        r#"{{"data_type": "movie", "files": {{".": {{"genre": [{}]}}}}}}"#,
        list.join(", ")
    )
}

fn manager(store: Arc<dyn TagStore>, root: &Path, watch: bool) -> IngestionManager {
    IngestionManager::new(
        store,
        Arc::new(LoaderRegistry::with_defaults()),
        IngestConfig {
            roots: vec![root.to_path_buf()],
            watch,
            debounce: Duration::from_millis(50),
            poll_wait: Duration::from_millis(20),
            idle_sleep: Duration::from_millis(5),
        },
    )
}

async fn names(dispatcher: &ViewDispatcher, path: &str) -> Vec<String> {
    match dispatcher.resolve(path).await {
        Ok(resolved) => resolved.names().into_iter().map(String::from).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_manifest_round_trip() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    write(&root.join("X/movie.stag"), &movie_manifest(&["Horror", "Comedy"]));

    let store = Arc::new(MemoryStore::new());
    manager(store.clone(), &root, false)
        .scan_initial()
        .await
        .unwrap();
    let dispatcher = ViewDispatcher::new(store);

    assert_eq!(names(&dispatcher, "/").await, vec!["movie"]);
    assert_eq!(names(&dispatcher, "/movie").await, vec!["genre"]);
    assert_eq!(names(&dispatcher, "/movie/genre").await, vec!["Horror", "Comedy"]);

    for genre in ["Horror", "Comedy"] {
        let resolved = dispatcher
            .resolve(&format!("/movie/genre/{genre}"))
            .await
            .unwrap();
        assert_eq!(
            resolved,
            Resolved::Directory(vec![ChildEntry::reference("X", root.join("X"))])
        );
    }
}

#[tokio::test]
async fn test_duplicate_tags_collapse() {
    let dir = tempdir().unwrap();
    write(
        &dir.path().join("Alien/movie.stag"),
        &movie_manifest(&["Horror", "Horror"]),
    );

    let store = Arc::new(MemoryStore::new());
    manager(store.clone(), dir.path(), false)
        .scan_initial()
        .await
        .unwrap();
    let dispatcher = ViewDispatcher::new(store);

    assert_eq!(names(&dispatcher, "/movie/genre").await, vec!["Horror"]);
    assert_eq!(names(&dispatcher, "/movie/genre/Horror").await, vec!["Alien"]);
}

#[tokio::test]
async fn test_origin_scoped_removal() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    write(&root.join("Alien/movie.stag"), &movie_manifest(&["Horror"]));
    let heat = write(
        &root.join("Heat/movie.stag"),
        &movie_manifest(&["Horror", "Crime"]),
    );

    let store = Arc::new(MemoryStore::new());
    manager(store.clone(), &root, false)
        .scan_initial()
        .await
        .unwrap();
    let before = store.stats().await.unwrap();

    // Heat's manifest owns its two references; tag directories are shared
    let removed = store.delete_by_origin(&heat).await.unwrap();
    assert_eq!(removed, 2);

    let after = store.stats().await.unwrap();
    assert_eq!(after.total_nodes, before.total_nodes - 2);
    assert_eq!(after.origins, 1);

    let dispatcher = ViewDispatcher::new(store);
    assert_eq!(names(&dispatcher, "/movie/genre").await, vec!["Horror", "Crime"]);
    assert_eq!(names(&dispatcher, "/movie/genre/Horror").await, vec!["Alien"]);
    assert_eq!(
        dispatcher.resolve("/movie/genre/Crime").await.unwrap(),
        Resolved::Directory(Vec::new())
    );
}

/// Alien and Heat share `genre/Horror`; Alien is loaded first, then rewritten
/// and finally deleted.
async fn first_manifest_changes(store: Arc<dyn TagStore>) {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let alien = write(&root.join("Alien/movie.stag"), &movie_manifest(&["Horror"]));
    write(&root.join("Heat/movie.stag"), &movie_manifest(&["Horror"]));

    let manager = manager(Arc::clone(&store), &root, false);
    manager.scan_initial().await.unwrap();
    let dispatcher = ViewDispatcher::new(store);
    assert_eq!(
        names(&dispatcher, "/movie/genre/Horror").await,
        vec!["Alien", "Heat"]
    );

    write(&alien, &movie_manifest(&["Comedy"]));
    manager.handle_event(WatchEvent::Modified(alien.clone())).await;
    assert_eq!(names(&dispatcher, "/movie/genre/Horror").await, vec!["Heat"]);
    assert_eq!(names(&dispatcher, "/movie/genre/Comedy").await, vec!["Alien"]);

    std::fs::remove_file(&alien).unwrap();
    manager.handle_event(WatchEvent::Deleted(alien)).await;
    assert_eq!(names(&dispatcher, "/movie/genre/Horror").await, vec!["Heat"]);
    assert!(names(&dispatcher, "/movie/genre/Comedy").await.is_empty());
    assert_eq!(manager.stats().await.errors, 0);
}

#[tokio::test]
async fn test_first_manifest_changes_memory() {
    first_manifest_changes(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_first_manifest_changes_sqlite() {
    let dir = tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("stagfs.sqlite")).unwrap();
    first_manifest_changes(Arc::new(store)).await;
}

#[tokio::test]
async fn test_broken_rewrite_keeps_previous_tags() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let manifest = write(&root.join("Alien/movie.stag"), &movie_manifest(&["Horror"]));

    let store = Arc::new(SqliteStore::open(dir.path().join("stagfs.sqlite")).unwrap());
    let manager = manager(store.clone(), &root, false);
    manager.scan_initial().await.unwrap();

    write(&manifest, "{ broken");
    manager
        .handle_event(WatchEvent::Modified(manifest.clone()))
        .await;

    assert_eq!(store.list_origins().await.unwrap(), vec![manifest]);
    let dispatcher = ViewDispatcher::new(store);
    assert_eq!(names(&dispatcher, "/movie/genre/Horror").await, vec!["Alien"]);
}

#[tokio::test]
async fn test_resolution_failures() {
    let dir = tempdir().unwrap();
    write(&dir.path().join("Alien/movie.stag"), &movie_manifest(&["Horror"]));

    let store = Arc::new(MemoryStore::new());
    manager(store.clone(), dir.path(), false)
        .scan_initial()
        .await
        .unwrap();
    let dispatcher = ViewDispatcher::new(store);

    assert!(matches!(
        dispatcher.resolve("/movie/genre/Nonexistent").await,
        Err(ViewError::NotFound(_))
    ));
    assert!(matches!(
        dispatcher.resolve("/nonexistentdatatype").await,
        Err(ViewError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_leaf_and_directory_resolution() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    write(
        &root.join("shelf/movies.stag.toml"),
        r#"
        data_type = "movie"

        [files."Alien.mkv"]
        year = "1979"
        genre = ["Horror", "Sci-Fi"]
        "#,
    );
    write(&root.join("shelf/Alien.mkv"), "frames");

    let store = Arc::new(MemoryStore::new());
    manager(store.clone(), &root, false)
        .scan_initial()
        .await
        .unwrap();
    let dispatcher = ViewDispatcher::new(store);

    let dir_result = dispatcher.resolve("/movie/genre").await.unwrap();
    assert!(dir_result.is_directory());
    assert_eq!(dir_result.names(), vec!["Horror", "Sci-Fi"]);

    let leaf = dispatcher
        .resolve("/movie/genre/Sci-Fi/Alien.mkv")
        .await
        .unwrap();
    assert_eq!(leaf, Resolved::File(root.join("shelf/Alien.mkv")));

    // A scalar value is a leaf directly under its key
    let year = dispatcher.resolve("/movie/year").await.unwrap();
    assert_eq!(year.names(), vec!["Alien.mkv"]);
}

#[tokio::test]
async fn test_dangling_targets_are_skipped() {
    let dir = tempdir().unwrap();
    write(
        &dir.path().join("shelf/movies.stag"),
        r#"{"data_type": "movie", "files": {
            "Alien.mkv": {"genre": ["Horror"]},
            "Missing.mkv": {"genre": ["Western"]}
        }}"#,
    );
    write(&dir.path().join("shelf/Alien.mkv"), "frames");

    let store = Arc::new(MemoryStore::new());
    manager(store.clone(), dir.path(), false)
        .scan_initial()
        .await
        .unwrap();
    let dispatcher = ViewDispatcher::new(store);

    assert_eq!(names(&dispatcher, "/movie/genre").await, vec!["Horror"]);
}

#[tokio::test]
async fn test_modify_event_replaces_assignments() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let manifest = write(&root.join("Alien/movie.stag"), &movie_manifest(&["Horror"]));

    let store = Arc::new(MemoryStore::new());
    let manager = manager(store.clone(), &root, false);
    manager.scan_initial().await.unwrap();

    write(&manifest, &movie_manifest(&["Sci-Fi", "Classic"]));
    manager.handle_event(WatchEvent::Modified(manifest)).await;

    let dispatcher = ViewDispatcher::new(store);
    assert_eq!(
        names(&dispatcher, "/movie/genre").await,
        vec!["Horror", "Sci-Fi", "Classic"]
    );
    assert!(names(&dispatcher, "/movie/genre/Horror").await.is_empty());
    assert_eq!(names(&dispatcher, "/movie/genre/Classic").await, vec!["Alien"]);
}

#[tokio::test]
async fn test_live_watch_picks_up_changes() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let manifest = write(&root.join("Alien/movie.stag"), &movie_manifest(&["Horror"]));

    let store = Arc::new(MemoryStore::new());
    let manager = manager(store.clone(), &root, true);
    manager.start().await.unwrap();

    write(&manifest, &movie_manifest(&["Sci-Fi"]));

    let dispatcher = ViewDispatcher::new(store);
    let mut tagged = Vec::new();
    for _ in 0..200 {
        tagged = names(&dispatcher, "/movie/genre/Sci-Fi").await;
        if tagged == vec!["Alien"] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    manager.stop().await;

    assert_eq!(tagged, vec!["Alien"]);
    assert!(names(&dispatcher, "/movie/genre/Horror").await.is_empty());
}

#[tokio::test]
async fn test_sqlite_forest_survives_restart() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("media");
    write(&root.join("Alien/movie.stag"), &movie_manifest(&["Horror"]));
    let db = dir.path().join("forest/stagfs.sqlite");

    {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let loaded = manager(store, &root, false).scan_initial().await.unwrap();
        assert_eq!(loaded, 1);
    }

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    store.init().await.unwrap();
    let dispatcher = ViewDispatcher::new(store);

    assert_eq!(names(&dispatcher, "/movie/genre/Horror").await, vec!["Alien"]);
    let leaf = dispatcher.resolve("/movie/genre/Horror/Alien").await.unwrap();
    assert_eq!(
        leaf,
        Resolved::File(root.canonicalize().unwrap().join("Alien"))
    );
}
