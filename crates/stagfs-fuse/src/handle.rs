//! Open file handles on backing files.

use stagfs_core::{HandleError, Resolved, ViewError};
use stagfs_view::ViewDispatcher;
use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Advisory byte-range lock as exchanged with the kernel.
///
/// `end` is inclusive; `u64::MAX` or `i64::MAX` means "to end of file".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteLock {
    pub start: u64,
    pub end: u64,
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`
    pub typ: i32,
    pub pid: u32,
}

impl ByteLock {
    fn to_flock(self) -> libc::flock {
        // SAFETY: flock is a plain C struct; all-zero is a valid value
        #[allow(unsafe_code)]
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = self.typ as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = self.start as libc::off_t;
        fl.l_len = if self.end >= i64::MAX as u64 {
            0
        } else {
            (self.end - self.start + 1) as libc::off_t
        };
        fl.l_pid = self.pid as libc::pid_t;
        fl
    }

    fn from_flock(fl: &libc::flock) -> Self {
        let start = fl.l_start as u64;
        let end = if fl.l_len == 0 {
            i64::MAX as u64
        } else {
            start + fl.l_len as u64 - 1
        };
        Self {
            start,
            end,
            typ: i32::from(fl.l_type),
            pid: fl.l_pid as u32,
        }
    }
}

/// An opened backing file.
///
/// The virtual path is resolved once, at open. Every operation afterwards
/// runs against the open descriptor under the handle's lock.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileHandle {
    /// Resolve `virtual_path` and open its backing file with `flags`.
    pub async fn open(
        dispatcher: &ViewDispatcher,
        virtual_path: &str,
        flags: i32,
    ) -> Result<Self, HandleError> {
        let backing = match dispatcher.resolve(virtual_path).await {
            Ok(Resolved::File(path)) => path,
            Ok(Resolved::Directory(_)) => {
                return Err(HandleError::NotAFile(PathBuf::from(virtual_path)));
            }
            Err(ViewError::NotFound(path)) => return Err(HandleError::NotFound(path)),
            Err(e) => return Err(HandleError::Io(io::Error::other(e.to_string()))),
        };

        debug!("Opening {} -> {:?} (flags {:#o})", virtual_path, backing, flags);
        Self::open_backing(&backing, flags)
    }

    /// Open a backing path directly.
    pub fn open_backing(path: &Path, flags: i32) -> Result<Self, HandleError> {
        let accmode = flags & libc::O_ACCMODE;
        let mut options = OpenOptions::new();
        options
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .append(flags & libc::O_APPEND != 0)
            .truncate(accmode != libc::O_RDONLY && flags & libc::O_TRUNC != 0)
            .custom_flags(
                flags
                    & !(libc::O_ACCMODE
                        | libc::O_APPEND
                        | libc::O_TRUNC
                        | libc::O_CREAT
                        | libc::O_EXCL),
            );

        let file = options.open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Backing path this handle was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read up to `size` bytes at `offset`. Short only at end of file.
    pub fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>, HandleError> {
        let file = self.file();
        let mut buf = vec![0u8; size];
        let mut filled = 0;

        while filled < size {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        buf.truncate(filled);
        trace!("read {} bytes at {} from {:?}", filled, offset, self.path);
        Ok(buf)
    }

    /// Write all of `data` at `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, HandleError> {
        let file = self.file();
        file.write_all_at(data, offset)?;
        trace!("wrote {} bytes at {} to {:?}", data.len(), offset, self.path);
        Ok(data.len())
    }

    pub fn truncate(&self, size: u64) -> Result<(), HandleError> {
        self.file().set_len(size)?;
        Ok(())
    }

    pub fn metadata(&self) -> Result<Metadata, HandleError> {
        Ok(self.file().metadata()?)
    }

    /// Flush by closing a duplicate of the descriptor, leaving the handle
    /// itself open for other readers.
    pub fn flush(&self) -> Result<(), HandleError> {
        let file = self.file();
        let dup = file.try_clone()?;
        drop(dup);
        Ok(())
    }

    /// Commit file data (and metadata unless `datasync`) to storage.
    pub fn sync(&self, datasync: bool) -> Result<(), HandleError> {
        let file = self.file();
        let dup = file.try_clone()?;
        if datasync {
            dup.sync_data()?;
        } else {
            dup.sync_all()?;
        }
        Ok(())
    }

    /// Test for a conflicting lock. Returns the conflicting lock, or the
    /// request with `typ == F_UNLCK` when there is none.
    pub fn get_lock(&self, lock: ByteLock) -> Result<ByteLock, HandleError> {
        let file = self.file();
        let mut fl = lock.to_flock();
        // SAFETY: fd is open for the lifetime of the guard; fl is a valid flock
        #[allow(unsafe_code)]
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl as *mut libc::flock) };
        if rc == -1 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ByteLock::from_flock(&fl))
    }

    /// Acquire or release a lock. With `wait`, blocks until it is granted.
    pub fn set_lock(&self, lock: ByteLock, wait: bool) -> Result<(), HandleError> {
        let file = self.file();
        let fl = lock.to_flock();
        let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
        // SAFETY: fd is open for the lifetime of the guard; fl is a valid flock
        #[allow(unsafe_code)]
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl as *const libc::flock) };
        if rc == -1 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}
