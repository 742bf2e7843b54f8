//! Tag forest storage for StagFS.
//!
//! This crate implements the [`TagStore`](stagfs_core::TagStore) trait twice:
//!
//! - [`SqliteStore`]: persistent store in a single `SQLite` table
//! - [`MemoryStore`]: arena-backed store for tests and ephemeral mounts
//!
//! # Example
//!
//! ```rust,ignore
//! use stagfs_store::SqliteStore;
//! use stagfs_core::TagStore;
//!
//! let store = SqliteStore::open("path/to/stagfs.sqlite")?;
//! store.init().await?;
//!
//! let datatypes = store.list_datatypes().await?;
//! ```

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
