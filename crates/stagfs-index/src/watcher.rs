//! Source-root watcher.
//!
//! Debounced notify events are converted into [`WatchEvent`]s on a std
//! thread and forwarded into the ingestion loop's channel.

use notify_debouncer_full::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache, new_debouncer,
};
use stagfs_core::{WatchError, WatchEvent};
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, trace, warn};

/// File system watcher with debouncing.
pub struct FileWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl FileWatcher {
    /// Create a watcher that forwards events into `event_tx`.
    pub fn new(
        event_tx: tokio_mpsc::Sender<WatchEvent>,
        debounce: Duration,
    ) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("stagfs-watch".to_string())
            .spawn(move || {
                while let Ok(result) = rx.recv() {
                    if !forward_events(result, &event_tx) {
                        break;
                    }
                }
                debug!("Watch event thread exiting");
            })
            .map_err(|e| WatchError::Init(e.to_string()))?;

        let debouncer = new_debouncer(debounce, None, move |result| {
            let _ = tx.send(result);
        })
        .map_err(|e| WatchError::Init(e.to_string()))?;

        Ok(Self { debouncer })
    }

    /// Start watching a source root recursively.
    pub fn watch(&mut self, path: &Path) -> Result<(), WatchError> {
        debug!("Starting to watch: {:?}", path);
        self.debouncer
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| WatchError::Registration {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

/// Forward one debounced batch. Returns `false` once the receiver is gone.
fn forward_events(result: DebounceEventResult, event_tx: &tokio_mpsc::Sender<WatchEvent>) -> bool {
    match result {
        Ok(events) => {
            for event in events {
                if let Some(watch_event) = convert_event(&event) {
                    trace!("Watch event: {:?}", watch_event);
                    // Use blocking send since we're in a std thread
                    if event_tx.blocking_send(watch_event).is_err() {
                        warn!("Event channel closed");
                        return false;
                    }
                }
            }
        }
        Err(errors) => {
            for error in errors {
                error!("Watch error: {error}");
            }
        }
    }
    true
}

fn convert_event(event: &DebouncedEvent) -> Option<WatchEvent> {
    use notify_debouncer_full::notify::EventKind;
    use notify_debouncer_full::notify::event::{ModifyKind, RenameMode};

    let path = event.paths.first()?.clone();

    match &event.kind {
        EventKind::Create(_) => Some(WatchEvent::Created(path)),
        EventKind::Remove(_) => Some(WatchEvent::Deleted(path)),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => Some(WatchEvent::MovedOut(path)),
            RenameMode::To => Some(WatchEvent::MovedIn(path)),
            RenameMode::Both if event.paths.len() >= 2 => Some(WatchEvent::Renamed {
                from: path,
                to: event.paths[1].clone(),
            }),
            _ if path.exists() => Some(WatchEvent::MovedIn(path)),
            _ => Some(WatchEvent::MovedOut(path)),
        },
        EventKind::Modify(_) => Some(WatchEvent::Modified(path)),
        EventKind::Other if event.paths.len() >= 2 => Some(WatchEvent::Renamed {
            from: path,
            to: event.paths[1].clone(),
        }),
        _ => None,
    }
}
