//! FUSE filesystem implementation.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyLock, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, EROFS, c_int};
use stagfs_core::{ChildEntry, HandleError, Resolved, ViewError};
use stagfs_view::ViewDispatcher;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::handle::{ByteLock, FileHandle};
use crate::inode::{InodeTable, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u64 = 512;

/// Presentation options for a mount.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOptions {
    /// Present leaves as symbolic links to their backing path instead of
    /// mirroring the backing file.
    pub symlinks: bool,
}

/// Map a resolution error to an errno.
fn view_errno(err: &ViewError) -> c_int {
    match err {
        ViewError::NotFound(_) => ENOENT,
        ViewError::Store(e) => {
            warn!("Store error during resolution: {}", e);
            EIO
        }
    }
}

/// Map a handle error to an errno.
fn handle_errno(err: &HandleError) -> c_int {
    match err {
        HandleError::NotFound(_) => ENOENT,
        HandleError::NotAFile(_) => EISDIR,
        HandleError::Io(e) => e.raw_os_error().unwrap_or(EIO),
    }
}

/// Attributes mirrored from a real file.
fn real_path_to_attr(path: &Path, ino: u64) -> Option<FileAttr> {
    let metadata = fs::metadata(path).ok()?;
    let kind = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.is_file() {
        FileType::RegularFile
    } else {
        return None;
    };

    let atime = metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
    let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let ctime = UNIX_EPOCH + Duration::from_secs(metadata.ctime() as u64);

    Some(FileAttr {
        ino,
        size: metadata.len(),
        blocks: metadata.len().div_ceil(BLOCK_SIZE),
        atime,
        mtime,
        ctime,
        crtime: ctime,
        kind,
        perm: (metadata.mode() & 0o7777) as u16,
        nlink: metadata.nlink() as u32,
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: metadata.rdev() as u32,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    })
}

/// StagFS FUSE filesystem.
///
/// Every callback resolves the inode's virtual path through the
/// [`ViewDispatcher`]. Tag directories are synthesized; leaves mirror (or
/// link to) their backing files.
pub struct StagFs {
    dispatcher: Arc<ViewDispatcher>,
    /// Inode table
    inodes: Arc<RwLock<InodeTable>>,
    /// Open handles by FUSE file handle number
    handles: HashMap<u64, Arc<FileHandle>>,
    next_fh: u64,
    options: FsOptions,
    /// Tokio runtime handle for async operations
    runtime: Handle,
}

impl StagFs {
    /// Create a filesystem serving `dispatcher`.
    ///
    /// Callbacks block on `runtime`, so the FUSE session must run on a
    /// thread outside that runtime's async context.
    pub fn new(dispatcher: Arc<ViewDispatcher>, runtime: Handle, options: FsOptions) -> Self {
        Self {
            dispatcher,
            inodes: Arc::new(RwLock::new(InodeTable::new())),
            handles: HashMap::new(),
            next_fh: 1,
            options,
            runtime,
        }
    }

    #[allow(unsafe_code)]
    fn make_attr(&self, ino: u64, kind: FileType, size: u64) -> FileAttr {
        let now = SystemTime::now();
        // SAFETY: getuid() and getgid() are always safe to call
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(BLOCK_SIZE),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: match kind {
                FileType::Directory => 0o555,
                FileType::Symlink => 0o777,
                _ => 0o444,
            },
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid,
            gid,
            rdev: 0,
            blksize: BLOCK_SIZE as u32,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        let inodes = self.runtime.block_on(self.inodes.read());
        inodes.path(ino).map(str::to_string).ok_or(ENOENT)
    }

    fn resolve(&self, path: &str) -> Result<Resolved, c_int> {
        self.runtime
            .block_on(self.dispatcher.resolve(path))
            .map_err(|e| view_errno(&e))
    }

    fn attr_for(&self, ino: u64, resolved: &Resolved) -> Result<FileAttr, c_int> {
        match resolved {
            Resolved::Directory(_) => Ok(self.make_attr(ino, FileType::Directory, 0)),
            Resolved::File(path) if self.options.symlinks => Ok(self.make_attr(
                ino,
                FileType::Symlink,
                path.as_os_str().len() as u64,
            )),
            // A dangling backing path is treated as absent
            Resolved::File(path) => real_path_to_attr(path, ino).ok_or(ENOENT),
        }
    }

    fn entry_kind(&self, entry: &ChildEntry) -> FileType {
        match &entry.backing_path {
            None => FileType::Directory,
            Some(_) if self.options.symlinks => FileType::Symlink,
            Some(path) if path.is_dir() => FileType::Directory,
            Some(_) => FileType::RegularFile,
        }
    }

    /// Resolve `name` in `parent` and register its inode.
    fn do_lookup(&self, parent: u64, name: &str) -> Result<FileAttr, c_int> {
        let parent_path = self.path_of(parent)?;
        let resolved = self.resolve(&crate::inode::child_path(&parent_path, name))?;

        let mut inodes = self.runtime.block_on(self.inodes.write());
        let ino = inodes.get_or_create(parent, name).ok_or(ENOENT)?;
        let attr = self.attr_for(ino, &resolved)?;
        inodes.lookup(ino);
        Ok(attr)
    }

    fn do_getattr(&self, ino: u64) -> Result<FileAttr, c_int> {
        let path = self.path_of(ino)?;
        let resolved = self.resolve(&path)?;
        self.attr_for(ino, &resolved)
    }

    /// Entries of a directory inode, `.` and `..` first.
    fn do_readdir(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, c_int> {
        let path = self.path_of(ino)?;
        let children: Vec<(String, FileType)> = match self.resolve(&path)? {
            Resolved::Directory(entries) => entries
                .iter()
                .map(|entry| (entry.name.clone(), self.entry_kind(entry)))
                .collect(),
            Resolved::File(real) if !self.options.symlinks && real.is_dir() => {
                let read_dir = fs::read_dir(&real).map_err(|e| e.raw_os_error().unwrap_or(EIO))?;
                read_dir
                    .flatten()
                    .map(|entry| {
                        let kind = match entry.file_type() {
                            Ok(t) if t.is_dir() => FileType::Directory,
                            _ => FileType::RegularFile,
                        };
                        (entry.file_name().to_string_lossy().into_owned(), kind)
                    })
                    .collect()
            }
            Resolved::File(_) => return Err(ENOTDIR),
        };

        let mut inodes = self.runtime.block_on(self.inodes.write());
        let listed: Vec<&str> = children.iter().map(|(name, _)| name.as_str()).collect();
        inodes.prune_children(ino, &listed);
        let parent = inodes.get(ino).map_or(ROOT_INO, |entry| entry.parent);
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        for (name, kind) in children {
            let Some(child) = inodes.get_or_create(ino, &name) else {
                continue;
            };
            entries.push((child, kind, name));
        }
        Ok(entries)
    }

    fn do_open(&mut self, ino: u64, flags: i32) -> Result<u64, c_int> {
        let path = self.path_of(ino)?;
        let handle = self
            .runtime
            .block_on(FileHandle::open(&self.dispatcher, &path, flags))
            .map_err(|e| handle_errno(&e))?;

        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, Arc::new(handle));
        Ok(fh)
    }

    fn handle(&self, fh: u64) -> Result<Arc<FileHandle>, c_int> {
        self.handles.get(&fh).cloned().ok_or(EBADF)
    }

    fn do_truncate(&self, ino: u64, fh: Option<u64>, size: u64) -> Result<(), c_int> {
        if let Some(handle) = fh.and_then(|fh| self.handles.get(&fh)) {
            return handle.truncate(size).map_err(|e| handle_errno(&e));
        }

        let path = self.path_of(ino)?;
        let handle = self
            .runtime
            .block_on(FileHandle::open(&self.dispatcher, &path, libc::O_WRONLY))
            .map_err(|e| handle_errno(&e))?;
        handle.truncate(size).map_err(|e| handle_errno(&e))
    }
}

impl Filesystem for StagFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        debug!("FUSE init (symlinks: {})", self.options.symlinks);
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("FUSE destroy, {} handles open", self.handles.len());
        self.handles.clear();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name_str = name.to_string_lossy();
        debug!("lookup: parent={}, name={}", parent, name_str);

        match self.do_lookup(parent, &name_str) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!("forget: ino={}, nlookup={}", ino, nlookup);
        let mut inodes = self.runtime.block_on(self.inodes.write());
        inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr: ino={}", ino);

        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr: ino={}, size={:?}", ino, size);

        if let Some(new_size) = size
            && let Err(errno) = self.do_truncate(ino, fh, new_size)
        {
            reply.error(errno);
            return;
        }

        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink: ino={}", ino);

        let resolved = self.path_of(ino).and_then(|path| self.resolve(&path));
        match resolved {
            Ok(Resolved::File(target)) => reply.data(target.as_os_str().as_bytes()),
            Ok(Resolved::Directory(_)) => reply.error(EINVAL),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open: ino={}, flags={:#o}", ino, flags);

        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: ino={}, offset={}, size={}", ino, offset, size);

        let result = self.handle(fh).and_then(|handle| {
            handle
                .read_at(offset.max(0) as u64, size as usize)
                .map_err(|e| handle_errno(&e))
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write: ino={}, offset={}, len={}", ino, offset, data.len());

        let result = self.handle(fh).and_then(|handle| {
            handle
                .write_at(offset.max(0) as u64, data)
                .map_err(|e| handle_errno(&e))
        });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush: ino={}, fh={}", ino, fh);

        match self
            .handle(fh)
            .and_then(|handle| handle.flush().map_err(|e| handle_errno(&e)))
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync: ino={}, fh={}, datasync={}", ino, fh, datasync);

        match self
            .handle(fh)
            .and_then(|handle| handle.sync(datasync).map_err(|e| handle_errno(&e)))
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release: ino={}, fh={}", ino, fh);
        self.handles.remove(&fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("opendir: ino={}, flags={}", ino, flags);
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);

        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        debug!("getlk: ino={}, fh={}, {}..={} type={}", ino, fh, start, end, typ);

        let lock = ByteLock {
            start,
            end,
            typ,
            pid,
        };
        match self
            .handle(fh)
            .and_then(|handle| handle.get_lock(lock).map_err(|e| handle_errno(&e)))
        {
            Ok(found) => reply.locked(found.start, found.end, found.typ, found.pid),
            Err(errno) => reply.error(errno),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        debug!("setlk: ino={}, fh={}, {}..={} type={} sleep={}", ino, fh, start, end, typ, sleep);

        let lock = ByteLock {
            start,
            end,
            typ,
            pid,
        };
        match self
            .handle(fh)
            .and_then(|handle| handle.set_lock(lock, sleep).map_err(|e| handle_errno(&e)))
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create: parent={}, name={:?} rejected", parent, name);
        reply.error(EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir: parent={}, name={:?} rejected", parent, name);
        reply.error(EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink: parent={}, name={:?} rejected", parent, name);
        reply.error(EROFS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir: parent={}, name={:?} rejected", parent, name);
        reply.error(EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!("rename: parent={}, name={:?} rejected", parent, name);
        reply.error(EROFS);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink: parent={}, name={:?} rejected", parent, link_name);
        reply.error(EROFS);
    }
}
