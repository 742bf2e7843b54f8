//! FUSE filesystem implementation for StagFS.
//!
//! This crate exposes the tag forest through standard filesystem
//! operations. Every path is resolved by a [`stagfs_view::ViewDispatcher`];
//! tag directories are synthesized and read-only, leaves pass through to
//! their backing files.
//!
//! # Virtual Directory Structure
//!
//! ```text
//! /mountpoint/
//! ├── movie/                     # One directory per datatype
//! │   ├── genre/
//! │   │   ├── Horror/
//! │   │   │   └── Alien          # Leaf → /media/movies/Alien
//! │   │   └── Sci-Fi/
//! │   │       └── Alien
//! │   └── year/
//! │       └── 1979/
//! │           └── Alien
//! └── music/
//!     └── ...
//! ```
//!
//! Leaves either mirror the backing file's attributes and forward I/O to it
//! through a [`FileHandle`], or, with [`FsOptions::symlinks`], appear as
//! symbolic links to the backing path.
//!
//! # Basic Usage
//!
//! ```bash
//! stagfs mount /mnt/stagfs -s /media/movies -f
//! ls /mnt/stagfs/movie/genre/Horror
//! fusermount -u /mnt/stagfs
//! ```

pub mod filesystem;
pub mod handle;
pub mod inode;

pub use filesystem::{FsOptions, StagFs};
pub use handle::{ByteLock, FileHandle};
pub use inode::{InodeTable, ROOT_INO};
