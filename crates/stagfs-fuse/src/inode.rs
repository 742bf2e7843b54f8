//! Inode management.
//!
//! Virtual paths are the identity of every node the kernel sees. The table
//! hands out a stable inode number per path for as long as the kernel keeps
//! a reference to it.

use std::collections::{HashMap, HashSet};

/// Root inode number (FUSE convention).
pub const ROOT_INO: u64 = 1;

/// First inode handed out for paths below the root.
pub const FIRST_PATH_INO: u64 = 2;

/// Entry in the inode table.
#[derive(Debug, Clone)]
pub struct InodeEntry {
    /// Inode number
    pub ino: u64,
    /// Absolute virtual path, always starting with `/`
    pub path: String,
    /// Parent inode
    pub parent: u64,
    /// Lookup count (for FUSE forget)
    pub lookup_count: u64,
}

/// Inode table mapping virtual paths to inode numbers.
pub struct InodeTable {
    inodes: HashMap<u64, InodeEntry>,
    path_to_ino: HashMap<String, u64>,
    next_ino: u64,
}

/// Join a child name onto a virtual directory path.
#[must_use]
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

impl InodeTable {
    /// Create a table holding only the root.
    #[must_use]
    pub fn new() -> Self {
        let mut table = Self {
            inodes: HashMap::new(),
            path_to_ino: HashMap::new(),
            next_ino: FIRST_PATH_INO,
        };

        table.inodes.insert(
            ROOT_INO,
            InodeEntry {
                ino: ROOT_INO,
                path: "/".to_string(),
                parent: ROOT_INO,
                lookup_count: 1,
            },
        );
        table.path_to_ino.insert("/".to_string(), ROOT_INO);

        table
    }

    /// Get inode entry.
    pub fn get(&self, ino: u64) -> Option<&InodeEntry> {
        self.inodes.get(&ino)
    }

    /// Virtual path of an inode.
    pub fn path(&self, ino: u64) -> Option<&str> {
        self.inodes.get(&ino).map(|entry| entry.path.as_str())
    }

    /// Get or create the inode for `name` inside the directory `parent`.
    ///
    /// Returns `None` when the parent inode is unknown.
    pub fn get_or_create(&mut self, parent: u64, name: &str) -> Option<u64> {
        let path = child_path(self.path(parent)?, name);
        if let Some(&ino) = self.path_to_ino.get(&path) {
            return Some(ino);
        }

        let ino = self.next_ino;
        self.next_ino += 1;

        self.inodes.insert(
            ino,
            InodeEntry {
                ino,
                path: path.clone(),
                parent,
                lookup_count: 0,
            },
        );
        self.path_to_ino.insert(path, ino);

        Some(ino)
    }

    /// Increment lookup count.
    pub fn lookup(&mut self, ino: u64) {
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.lookup_count += 1;
        }
    }

    /// Decrement lookup count, dropping the entry once the kernel holds no
    /// more references. The root is never dropped.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        let Some(entry) = self.inodes.get_mut(&ino) else {
            return;
        };
        entry.lookup_count = entry.lookup_count.saturating_sub(nlookup);

        if entry.lookup_count == 0 && ino != ROOT_INO {
            let path = entry.path.clone();
            self.inodes.remove(&ino);
            self.path_to_ino.remove(&path);
        }
    }

    /// Drop children of `parent` the kernel never looked up and that are no
    /// longer among `names`. Returns the number dropped.
    ///
    /// Listing a directory hands out inodes without a lookup reference, and
    /// the kernel never forgets those; relisting is where they are reclaimed.
    pub fn prune_children(&mut self, parent: u64, names: &[&str]) -> usize {
        let Some(parent_path) = self.path(parent) else {
            return 0;
        };
        let live: HashSet<String> = names
            .iter()
            .map(|name| child_path(parent_path, name))
            .collect();
        let parents: HashSet<u64> = self.inodes.values().map(|entry| entry.parent).collect();

        let doomed: Vec<u64> = self
            .inodes
            .values()
            .filter(|entry| {
                entry.parent == parent
                    && entry.ino != ROOT_INO
                    && entry.lookup_count == 0
                    && !parents.contains(&entry.ino)
                    && !live.contains(&entry.path)
            })
            .map(|entry| entry.ino)
            .collect();

        for ino in &doomed {
            if let Some(entry) = self.inodes.remove(ino) {
                self.path_to_ino.remove(&entry.path);
            }
        }
        doomed.len()
    }

    /// Get inode by virtual path.
    pub fn get_by_path(&self, path: &str) -> Option<u64> {
        self.path_to_ino.get(path).copied()
    }

    /// Number of live inodes, root included.
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
