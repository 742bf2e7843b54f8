//! Ingestion service: initial scan and change watching.

use chrono::Utc;
use stagfs_core::{Error, IngestStats, LoadSummary, Result, TagStore, WatchEvent};
use stagfs_loader::LoaderRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::watcher::FileWatcher;

/// Lifecycle of the ingestion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Stopped,
    ScanningInitial,
    Watching,
    Stopping,
}

/// Ingestion update events.
#[derive(Debug, Clone)]
pub enum IngestUpdate {
    ScanStarted { roots: usize },
    ManifestLoaded { path: PathBuf, summary: LoadSummary },
    ManifestRemoved { path: PathBuf, nodes: u64 },
    ManifestError { path: PathBuf, error: String },
    WatchFailed { path: PathBuf, error: String },
    ScanCompleted { manifests: usize },
}

/// Configuration for the ingestion service.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Source roots to scan and watch
    pub roots: Vec<PathBuf>,
    /// Keep the forest in sync after the initial scan
    pub watch: bool,
    /// Debounce window for change notifications
    pub debounce: Duration,
    /// How long one loop iteration waits for an event
    pub poll_wait: Duration,
    /// Pause between loop iterations
    pub idle_sleep: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            watch: true,
            debounce: Duration::from_millis(500),
            poll_wait: Duration::from_millis(250),
            idle_sleep: Duration::from_millis(100),
        }
    }
}

/// Shared ingestion state used by both the foreground API and the watch loop.
#[derive(Clone)]
struct Ingestor {
    store: Arc<dyn TagStore>,
    loaders: Arc<LoaderRegistry>,
    update_tx: broadcast::Sender<IngestUpdate>,
    stats: Arc<RwLock<IngestStats>>,
    /// Serialises every load and removal
    writer: Arc<Mutex<()>>,
}

impl Ingestor {
    fn notify(&self, update: IngestUpdate) {
        let _ = self.update_tx.send(update);
    }

    /// Ingest a manifest or every manifest below a directory.
    async fn ingest_path(&self, path: &Path) -> usize {
        if path.is_dir() {
            let root = path.to_path_buf();
            let loaders = Arc::clone(&self.loaders);
            let manifests = match tokio::task::spawn_blocking(move || {
                find_manifests(&root, &loaders)
            })
            .await
            {
                Ok(manifests) => manifests,
                Err(e) => {
                    error!("Scan task for {:?} failed: {}", path, e);
                    return 0;
                }
            };

            let mut loaded = 0;
            for manifest in manifests {
                if self.load_manifest(&manifest).await {
                    loaded += 1;
                }
            }
            loaded
        } else if path.is_file() && self.loaders.is_manifest(path) {
            usize::from(self.load_manifest(path).await)
        } else {
            0
        }
    }

    /// Replace everything `path` contributed with its current content.
    ///
    /// A manifest that fails to parse keeps its previously committed nodes.
    async fn load_manifest(&self, path: &Path) -> bool {
        let Some(loader) = self.loaders.get_for_path(path) else {
            return false;
        };

        let _guard = self.writer.lock().await;

        let entries = match loader.read_entries(path).await {
            Ok(entries) => entries,
            Err(e) => {
                self.record_error(Error::Ingestion {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
                .await;
                return false;
            }
        };

        if let Err(e) = self.store.delete_by_origin(path).await {
            self.record_error(Error::Ingestion {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
            .await;
            return false;
        }

        let summary = loader.commit(self.store.as_ref(), path, entries).await;
        info!(
            "Loaded {:?} ({} entries, {} references, {} skipped)",
            path, summary.entries, summary.references, summary.skipped
        );

        {
            let mut stats = self.stats.write().await;
            stats.manifests_loaded += 1;
            stats.last_update = Some(Utc::now());
        }

        self.notify(IngestUpdate::ManifestLoaded {
            path: path.to_path_buf(),
            summary,
        });
        true
    }

    /// Remove the nodes of `path` and of every manifest below it.
    async fn remove_path(&self, path: &Path) -> u64 {
        let _guard = self.writer.lock().await;

        let origins = match self.store.list_origins().await {
            Ok(origins) => origins,
            Err(e) => {
                error!("Cannot list origins while removing {:?}: {}", path, e);
                return 0;
            }
        };

        let mut removed = 0;
        for origin in origins.iter().filter(|o| o.starts_with(path)) {
            match self.store.delete_by_origin(origin).await {
                Ok(nodes) => {
                    debug!("Removed {} nodes from {:?}", nodes, origin);
                    removed += nodes;
                    {
                        let mut stats = self.stats.write().await;
                        stats.manifests_removed += 1;
                        stats.last_update = Some(Utc::now());
                    }
                    self.notify(IngestUpdate::ManifestRemoved {
                        path: origin.clone(),
                        nodes,
                    });
                }
                Err(e) => error!("Failed to remove {:?}: {}", origin, e),
            }
        }
        removed
    }

    async fn handle_event(&self, event: WatchEvent) {
        debug!("Handling watch event: {:?}", event);
        match event {
            WatchEvent::Created(path) | WatchEvent::MovedIn(path) => {
                self.ingest_path(&path).await;
            }
            // Reloaded in place; a rewrite that fails to parse keeps its nodes
            WatchEvent::Modified(path) if path.is_file() && self.loaders.is_manifest(&path) => {
                self.load_manifest(&path).await;
            }
            WatchEvent::Modified(path) => {
                self.remove_path(&path).await;
                self.ingest_path(&path).await;
            }
            WatchEvent::Deleted(path) | WatchEvent::MovedOut(path) => {
                self.remove_path(&path).await;
            }
            WatchEvent::Renamed { from, to } => {
                self.remove_path(&from).await;
                self.ingest_path(&to).await;
            }
        }
    }

    async fn record_error(&self, err: Error) {
        warn!("{}", err);
        self.stats.write().await.errors += 1;
        if let Error::Ingestion { path, reason } = err {
            self.notify(IngestUpdate::ManifestError {
                path,
                error: reason,
            });
        }
    }
}

/// Recursively collect manifests below `root`, sorted by path.
fn find_manifests(root: &Path, loaders: &LoaderRegistry) -> Vec<PathBuf> {
    fn visit_dir(dir: &Path, loaders: &LoaderRegistry, out: &mut Vec<PathBuf>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("Cannot read directory {:?}: {}", dir, e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                visit_dir(&path, loaders, out);
            } else if file_type.is_file() && loaders.is_manifest(&path) {
                out.push(path);
            }
        }
    }

    let mut out = Vec::new();
    visit_dir(root, loaders, &mut out);
    out.sort();
    out
}

/// Ingestion service.
///
/// Rebuilds the forest from the source roots, then keeps it in sync with
/// manifest changes until [`IngestionManager::stop`] is called.
pub struct IngestionManager {
    ingestor: Ingestor,
    config: IngestConfig,
    /// Current lifecycle state
    state: Arc<RwLock<IngestState>>,
    /// Cleared to ask the watch loop to exit
    running: Arc<RwLock<bool>>,
    /// File watcher (if active)
    watcher: Mutex<Option<FileWatcher>>,
    /// Watch loop task
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionManager {
    /// Create a new ingestion service. Roots are canonicalized when possible.
    pub fn new(
        store: Arc<dyn TagStore>,
        loaders: Arc<LoaderRegistry>,
        mut config: IngestConfig,
    ) -> Self {
        config.roots = config
            .roots
            .into_iter()
            .map(|root| std::fs::canonicalize(&root).unwrap_or(root))
            .collect();

        let (update_tx, _) = broadcast::channel(256);

        Self {
            ingestor: Ingestor {
                store,
                loaders,
                update_tx,
                stats: Arc::new(RwLock::new(IngestStats::default())),
                writer: Arc::new(Mutex::new(())),
            },
            config,
            state: Arc::new(RwLock::new(IngestState::Stopped)),
            running: Arc::new(RwLock::new(false)),
            watcher: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to ingestion updates.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestUpdate> {
        self.ingestor.update_tx.subscribe()
    }

    /// Source roots being ingested.
    pub fn roots(&self) -> &[PathBuf] {
        &self.config.roots
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> IngestState {
        *self.state.read().await
    }

    /// Snapshot of the ingestion counters.
    pub async fn stats(&self) -> IngestStats {
        self.ingestor.stats.read().await.clone()
    }

    /// Run the initial scan and, if enabled, start the watch loop.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != IngestState::Stopped {
                return Ok(());
            }
            *state = IngestState::ScanningInitial;
        }

        if let Err(e) = self.scan_initial().await {
            *self.state.write().await = IngestState::Stopped;
            return Err(e);
        }

        if !self.config.watch {
            *self.state.write().await = IngestState::Stopped;
            return Ok(());
        }

        let (event_tx, event_rx) = mpsc::channel(1024);
        let mut watcher = match FileWatcher::new(event_tx, self.config.debounce) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Change watching unavailable, serving scan results only: {}", e);
                *self.state.write().await = IngestState::Stopped;
                return Ok(());
            }
        };

        for root in &self.config.roots {
            if let Err(e) = watcher.watch(root) {
                warn!("{}; {:?} degrades to scan-only", e, root);
                self.ingestor.notify(IngestUpdate::WatchFailed {
                    path: root.clone(),
                    error: e.to_string(),
                });
            }
        }
        *self.watcher.lock().await = Some(watcher);

        *self.running.write().await = true;
        *self.state.write().await = IngestState::Watching;
        info!("Watching {} source roots", self.config.roots.len());

        let handle = tokio::spawn(watch_loop(
            self.ingestor.clone(),
            event_rx,
            Arc::clone(&self.running),
            self.config.poll_wait,
            self.config.idle_sleep,
        ));
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    /// Clear the forest and ingest every source root from scratch.
    ///
    /// Returns the number of manifests loaded.
    pub async fn scan_initial(&self) -> Result<usize> {
        info!("Scanning {} source roots", self.config.roots.len());
        self.ingestor.notify(IngestUpdate::ScanStarted {
            roots: self.config.roots.len(),
        });

        self.ingestor.store.init().await?;
        {
            let _guard = self.ingestor.writer.lock().await;
            self.ingestor.store.clear().await?;
        }

        let mut manifests = 0;
        for root in &self.config.roots {
            if !root.exists() {
                warn!("Source root {:?} does not exist", root);
                continue;
            }
            manifests += self.ingestor.ingest_path(root).await;
        }

        info!("Initial scan loaded {} manifests", manifests);
        self.ingestor
            .notify(IngestUpdate::ScanCompleted { manifests });
        Ok(manifests)
    }

    /// Ingest a single manifest or every manifest below a directory.
    pub async fn ingest_path(&self, path: &Path) -> usize {
        self.ingestor.ingest_path(path).await
    }

    /// Remove every node owned by `path` or by a manifest below it.
    pub async fn remove_path(&self, path: &Path) -> u64 {
        self.ingestor.remove_path(path).await
    }

    /// Apply one change notification.
    pub async fn handle_event(&self, event: WatchEvent) {
        self.ingestor.handle_event(event).await;
    }

    /// Stop the watch loop and release watch registrations.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state != IngestState::Watching {
                return;
            }
            *state = IngestState::Stopping;
        }

        info!("Stopping ingestion");
        *self.running.write().await = false;

        if let Some(handle) = self.task.lock().await.take()
            && let Err(e) = handle.await
        {
            error!("Watch loop ended abnormally: {}", e);
        }

        self.watcher.lock().await.take();
        *self.state.write().await = IngestState::Stopped;
        debug!("Ingestion stopped");
    }
}

async fn watch_loop(
    ingestor: Ingestor,
    mut event_rx: mpsc::Receiver<WatchEvent>,
    running: Arc<RwLock<bool>>,
    poll_wait: Duration,
    idle_sleep: Duration,
) {
    while *running.read().await {
        match tokio::time::timeout(poll_wait, event_rx.recv()).await {
            Ok(Some(event)) => {
                ingestor.handle_event(event).await;
                while let Ok(event) = event_rx.try_recv() {
                    ingestor.handle_event(event).await;
                }
            }
            Ok(None) => {
                debug!("Watch channel closed");
                break;
            }
            Err(_) => {}
        }
        tokio::time::sleep(idle_sleep).await;
    }

    event_rx.close();
    debug!("Watch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagfs_core::ChildEntry;
    use stagfs_store::MemoryStore;
    use tempfile::tempdir;

    fn write_manifest(dir: &Path, body: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join("movie.stag");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn genres(tags: &[&str]) -> String {
        let list: Vec<String> = tags.iter().map(|t| format!("\"{t}\"")).collect();
        format!(
            r#"{{"data_type": "movie", "files": {{".": {{"genre": [{}]}}}}}}"#,
            list.join(", ")
        )
    }

    fn manager(store: Arc<MemoryStore>, root: &Path) -> IngestionManager {
        IngestionManager::new(
            store,
            Arc::new(LoaderRegistry::with_defaults()),
            IngestConfig {
                roots: vec![root.to_path_buf()],
                watch: false,
                ..Default::default()
            },
        )
    }

    async fn genre_names(store: &MemoryStore) -> Vec<String> {
        let Ok(genre) = store.lookup_child("movie", None, "genre").await else {
            return Vec::new();
        };
        store
            .children("movie", Some(genre.id))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    async fn tagged(store: &MemoryStore, tag: &str) -> Vec<String> {
        let Ok(genre) = store.lookup_child("movie", None, "genre").await else {
            return Vec::new();
        };
        let Ok(tag) = store.lookup_child("movie", Some(genre.id), tag).await else {
            return Vec::new();
        };
        store
            .children("movie", Some(tag.id))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[tokio::test]
    async fn test_scan_initial_loads_nested_manifests() {
        let dir = tempdir().unwrap();
        write_manifest(&dir.path().join("Alien"), &genres(&["Horror"]));
        write_manifest(&dir.path().join("deep/Heat"), &genres(&["Crime"]));
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), dir.path());

        let loaded = manager.scan_initial().await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(genre_names(&store).await, vec!["Horror", "Crime"]);
    }

    #[tokio::test]
    async fn test_scan_initial_clears_previous_state() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .get_or_create_tag("stale", None, "tag", Path::new("/gone.stag"))
            .await
            .unwrap();

        let manager = manager(Arc::clone(&store), dir.path());
        manager.scan_initial().await.unwrap();
        assert!(store.list_datatypes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_manifest_is_isolated() {
        let dir = tempdir().unwrap();
        write_manifest(&dir.path().join("Alien"), &genres(&["Horror"]));
        write_manifest(&dir.path().join("Broken"), "{ nope");

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), dir.path());
        let mut updates = manager.subscribe();

        assert_eq!(manager.scan_initial().await.unwrap(), 1);
        assert_eq!(manager.stats().await.errors, 1);

        let mut saw_error = false;
        while let Ok(update) = updates.try_recv() {
            if let IngestUpdate::ManifestError { path, .. } = update {
                assert!(path.ends_with("Broken/movie.stag"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_modify_event_replaces_assignments() {
        let dir = tempdir().unwrap();
        let manifest = write_manifest(&dir.path().join("Alien"), &genres(&["Horror", "Comedy"]));

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), dir.path());
        manager.scan_initial().await.unwrap();
        assert_eq!(genre_names(&store).await, vec!["Horror", "Comedy"]);

        std::fs::write(&manifest, genres(&["Sci-Fi"])).unwrap();
        let manifest = std::fs::canonicalize(&manifest).unwrap();
        manager.handle_event(WatchEvent::Modified(manifest)).await;

        // Emptied tags stay listed
        assert_eq!(genre_names(&store).await, vec!["Horror", "Comedy", "Sci-Fi"]);
        assert!(tagged(&store, "Horror").await.is_empty());
        assert!(tagged(&store, "Comedy").await.is_empty());
        assert_eq!(tagged(&store, "Sci-Fi").await, vec!["Alien"]);
    }

    #[tokio::test]
    async fn test_broken_rewrite_keeps_committed_nodes() {
        let dir = tempdir().unwrap();
        let manifest = write_manifest(&dir.path().join("Alien"), &genres(&["Horror"]));

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), dir.path());
        manager.scan_initial().await.unwrap();
        let manifest = std::fs::canonicalize(&manifest).unwrap();

        std::fs::write(&manifest, "{ broken").unwrap();
        manager
            .handle_event(WatchEvent::Modified(manifest.clone()))
            .await;

        assert_eq!(store.list_origins().await.unwrap(), vec![manifest]);
        assert_eq!(tagged(&store, "Horror").await, vec!["Alien"]);
        assert_eq!(manager.stats().await.errors, 1);
    }

    #[tokio::test]
    async fn test_modify_of_first_manifest_keeps_shared_tags() {
        let dir = tempdir().unwrap();
        let alien = write_manifest(&dir.path().join("Alien"), &genres(&["Horror"]));
        write_manifest(&dir.path().join("Heat"), &genres(&["Horror"]));

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), dir.path());
        manager.scan_initial().await.unwrap();
        assert_eq!(tagged(&store, "Horror").await, vec!["Alien", "Heat"]);

        std::fs::write(&alien, genres(&["Comedy"])).unwrap();
        let alien = std::fs::canonicalize(&alien).unwrap();
        manager.handle_event(WatchEvent::Modified(alien)).await;

        assert_eq!(tagged(&store, "Horror").await, vec!["Heat"]);
        assert_eq!(tagged(&store, "Comedy").await, vec!["Alien"]);
        assert_eq!(manager.stats().await.errors, 0);
    }

    #[tokio::test]
    async fn test_delete_directory_removes_manifests_below() {
        let dir = tempdir().unwrap();
        write_manifest(&dir.path().join("shelf/Alien"), &genres(&["Horror"]));
        write_manifest(&dir.path().join("shelf/Heat"), &genres(&["Crime"]));
        write_manifest(&dir.path().join("Up"), &genres(&["Family"]));

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), dir.path());
        manager.scan_initial().await.unwrap();

        let shelf = manager.roots()[0].join("shelf");
        std::fs::remove_dir_all(&shelf).unwrap();
        manager.handle_event(WatchEvent::Deleted(shelf)).await;

        let origins = store.list_origins().await.unwrap();
        assert_eq!(origins.len(), 1);
        assert!(origins[0].ends_with("Up/movie.stag"));
    }

    #[tokio::test]
    async fn test_moved_in_directory_is_ingested() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), &root);
        manager.scan_initial().await.unwrap();

        write_manifest(&root.join("Alien"), &genres(&["Horror"]));
        let moved = manager.roots()[0].join("Alien");
        manager.handle_event(WatchEvent::MovedIn(moved.clone())).await;

        let horror = {
            let genre = store.lookup_child("movie", None, "genre").await.unwrap();
            store
                .lookup_child("movie", Some(genre.id), "Horror")
                .await
                .unwrap()
        };
        assert_eq!(
            store.children("movie", Some(horror.id)).await.unwrap(),
            vec![ChildEntry::reference("Alien", moved)]
        );
    }

    #[tokio::test]
    async fn test_rename_moves_origin() {
        let dir = tempdir().unwrap();
        write_manifest(&dir.path().join("Alien"), &genres(&["Horror"]));

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), dir.path());
        manager.scan_initial().await.unwrap();

        let from = manager.roots()[0].join("Alien");
        let to = manager.roots()[0].join("Aliens");
        std::fs::rename(&from, &to).unwrap();
        manager
            .handle_event(WatchEvent::Renamed {
                from,
                to: to.clone(),
            })
            .await;

        assert_eq!(
            store.list_origins().await.unwrap(),
            vec![to.join("movie.stag")]
        );
    }

    #[tokio::test]
    async fn test_start_without_watch_returns_to_stopped() {
        let dir = tempdir().unwrap();
        write_manifest(&dir.path().join("Alien"), &genres(&["Horror"]));

        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store), dir.path());
        manager.start().await.unwrap();

        assert_eq!(manager.state().await, IngestState::Stopped);
        assert_eq!(manager.stats().await.manifests_loaded, 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_watching() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let manager = IngestionManager::new(
            store,
            Arc::new(LoaderRegistry::with_defaults()),
            IngestConfig {
                roots: vec![dir.path().to_path_buf(), dir.path().join("missing")],
                poll_wait: Duration::from_millis(20),
                idle_sleep: Duration::from_millis(5),
                ..Default::default()
            },
        );
        let mut updates = manager.subscribe();

        manager.start().await.unwrap();
        assert_eq!(manager.state().await, IngestState::Watching);

        let mut watch_failed = false;
        while let Ok(update) = updates.try_recv() {
            watch_failed |= matches!(update, IngestUpdate::WatchFailed { .. });
        }
        assert!(watch_failed);

        manager.stop().await;
        assert_eq!(manager.state().await, IngestState::Stopped);
        manager.stop().await;
        assert_eq!(manager.state().await, IngestState::Stopped);
    }
}
