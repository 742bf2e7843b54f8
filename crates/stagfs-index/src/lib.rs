//! Ingestion engine for StagFS.
//!
//! This crate keeps the tag forest in step with the manifests found under
//! the configured source roots: a cold rebuild on start, then incremental
//! updates driven by filesystem notifications.
//!
//! # Components
//!
//! - [`IngestionManager`]: Initial scan, state machine and watch loop
//! - [`FileWatcher`]: Monitors source roots for changes
//! - [`IngestConfig`]: Roots and loop timing
//! - [`IngestUpdate`]: Events emitted during ingestion
//!
//! # Example
//!
//! ```rust,ignore
//! use stagfs_index::{IngestConfig, IngestionManager, IngestUpdate};
//!
//! let manager = IngestionManager::new(store, loaders, IngestConfig {
//!     roots: vec!["/media/movies".into()],
//!     ..Default::default()
//! });
//!
//! let mut updates = manager.subscribe();
//! manager.start().await?;
//!
//! while let Ok(update) = updates.recv().await {
//!     if let IngestUpdate::ManifestError { path, error } = update {
//!         eprintln!("{}: {}", path.display(), error);
//!     }
//! }
//! ```

pub mod manager;
pub mod watcher;

pub use manager::{IngestConfig, IngestState, IngestUpdate, IngestionManager};
pub use watcher::FileWatcher;
