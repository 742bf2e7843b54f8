//! # stagfs-core
//!
//! Core types and traits for StagFS, a filesystem that presents files as a
//! browsable tree of tags.
//!
//! Tags come from small manifest files placed next to the files they
//! describe. Every manifest declares a datatype (such as `movie`) and, per
//! file, a nested structure of tags. The tags form one forest per datatype:
//!
//! ```text
//! manifest → ManifestLoader → Mutation plan → TagStore
//!                                                ↓
//!                               virtual path → ViewDispatcher → Resolved
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TagNode`] | A persisted directory tag or file reference |
//! | [`ManifestValue`] | Nested tag structure of one manifest entry |
//! | [`Mutation`] | One planned change to the forest |
//! | [`Resolved`] | Directory listing or backing file of a virtual path |
//! | [`WatchEvent`] | Filesystem change notification |
//!
//! ## Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`TagStore`] | Persist and query the tag forest |
//! | [`ManifestLoader`] | Read manifests into mutation plans |
//!
//! ## Related Crates
//!
//! - `stagfs-store`: In-memory and `SQLite` tag stores
//! - `stagfs-loader`: Manifest formats and the loader registry
//! - `stagfs-index`: Initial scan and change watching
//! - `stagfs-view`: Virtual path resolution
//! - `stagfs-fuse`: FUSE filesystem

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, HandleError, LoadError, Result, StoreError, ViewError, WatchError};
pub use traits::*;
pub use types::*;
