//! Error types for StagFS.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for StagFS operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Tag store operation failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Manifest loading failed
    #[error("load error: {0}")]
    Load(#[from] LoadError),

    /// Virtual path resolution failed
    #[error("view error: {0}")]
    View(#[from] ViewError),

    /// Change-notification setup failed
    #[error("watch error: {0}")]
    Watch(#[from] WatchError),

    /// Open file handle operation failed
    #[error("handle error: {0}")]
    Handle(#[from] HandleError),

    /// A single manifest could not be ingested
    #[error("ingestion of {path:?} failed: {reason}")]
    Ingestion { path: PathBuf, reason: String },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tag store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store initialization failed: {0}")]
    Init(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("insert failed: {0}")]
    Insert(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Manifest loading errors.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("no loader for {0}")]
    UnsupportedType(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Virtual path resolution errors.
#[derive(Error, Debug)]
pub enum ViewError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Filesystem watch errors.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watcher could not be created: {0}")]
    Init(String),

    #[error("cannot watch {path:?}: {reason}")]
    Registration { path: PathBuf, reason: String },
}

/// Errors raised by an open file handle.
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("not a regular file: {0:?}")]
    NotAFile(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for StagFS operations.
pub type Result<T> = std::result::Result<T, Error>;
