//! flock(2)-based lock file
//!
//! The lock file holds two lines, the owner pid and the acquisition time
//! (seconds since the epoch). It's for people inspecting the runtime
//! directory; nothing reads it back.
//!
//! flock locks belong to the open file description, so two `FileLock`s in
//! the same process exclude each other just like two processes do.

use super::{CrossPlatformLock, LockKind};
use crate::error::LockError;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Attempts at acquiring before giving up when the file keeps being
/// replaced under us
const MAX_OPEN_ATTEMPTS: usize = 3;

pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Prepare a lock at `path`, creating its directory
    ///
    /// Fails when the directory can't be created or isn't writable. The
    /// lock file itself only exists while the lock is held.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        fs::create_dir_all(&dir)
            .map_err(|e| LockError::Directory(dir.display().to_string(), e))?;

        if !is_writable(&dir) {
            return Err(LockError::Directory(
                dir.display().to_string(),
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }

        Ok(Self { path, file: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, LockError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| LockError::Open(self.path.display().to_string(), e))
    }

    /// The path may have been unlinked by the previous owner between our
    /// open and our flock; in that case we hold a lock nobody else can see.
    fn still_linked(&self, file: &File) -> bool {
        match (file.metadata(), fs::metadata(&self.path)) {
            (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
            _ => false,
        }
    }

    fn write_owner(&self, file: &mut File) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let write = |file: &mut File| -> io::Result<()> {
            file.set_len(0)?;
            write!(file, "{}\n{}\n", std::process::id(), now)?;
            file.flush()
        };
        if let Err(e) = write(file) {
            tracing::debug!("Could not write owner info to {:?}: {}", self.path, e);
        }
    }
}

fn is_writable(dir: &Path) -> bool {
    match CString::new(dir.as_os_str().as_bytes()) {
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
        Ok(c_path) => unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 },
        Err(_) => false,
    }
}

impl CrossPlatformLock for FileLock {
    fn try_acquire_immediate(&mut self) -> bool {
        if self.file.is_some() {
            return false;
        }

        for _ in 0..MAX_OPEN_ATTEMPTS {
            let mut file = match self.open() {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!("{}", e);
                    return false;
                }
            };

            // SAFETY: the descriptor is owned by `file` and stays open for the call
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    tracing::warn!("flock on {:?} failed: {}", self.path, err);
                }
                return false;
            }

            if !self.still_linked(&file) {
                tracing::trace!("Lock file {:?} was replaced, retrying", self.path);
                continue;
            }

            self.write_owner(&mut file);
            self.file = Some(file);
            tracing::debug!("Acquired file lock {:?}", self.path);
            return true;
        }

        false
    }

    fn release_immediate(&mut self) -> bool {
        let Some(file) = self.file.take() else {
            return true;
        };

        // Unlink while still holding the lock so a waiter that opened the
        // old inode notices the replacement.
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove lock file {:?}: {}", self.path, e);
            }
        }

        // SAFETY: the descriptor is still owned by `file`
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            tracing::warn!(
                "Failed to unlock {:?}: {}",
                self.path,
                io::Error::last_os_error()
            );
        }
        drop(file);

        tracing::debug!("Released file lock {:?}", self.path);
        true
    }

    fn is_locked_by_me(&self) -> bool {
        self.file.is_some()
    }

    fn kind(&self) -> LockKind {
        LockKind::File
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release_immediate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_owner_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotkey-menu.lock");
        let mut lock = FileLock::new(&path).unwrap();

        assert!(!path.exists());
        assert!(lock.try_acquire_immediate());
        assert!(lock.is_locked_by_me());

        let contents = fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(std::process::id().to_string().as_str()));
        let stamp: f64 = lines.next().unwrap().parse().unwrap();
        assert!(stamp > 0.0);
    }

    #[test]
    fn test_second_instance_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotkey-f12.lock");
        let mut first = FileLock::new(&path).unwrap();
        let mut second = FileLock::new(&path).unwrap();

        assert!(first.try_acquire_immediate());
        assert!(!second.try_acquire_immediate());
        assert!(!second.is_locked_by_me());

        assert!(first.release_immediate());
        assert!(second.try_acquire_immediate());
    }

    #[test]
    fn test_release_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotkey-pause.lock");
        let mut lock = FileLock::new(&path).unwrap();

        assert!(lock.try_acquire_immediate());
        assert!(lock.release_immediate());
        assert!(!path.exists());
        assert!(lock.release_immediate());
        assert!(!lock.is_locked_by_me());
    }

    #[test]
    fn test_reacquire_while_held_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new(dir.path().join("hotkey-a.lock")).unwrap();
        assert!(lock.try_acquire_immediate());
        assert!(!lock.try_acquire_immediate());
        assert!(lock.is_locked_by_me());
    }

    #[test]
    fn test_new_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("voice-mcp-locks");
        let _lock = FileLock::new(nested.join("hotkey-menu.lock")).unwrap();
        assert!(nested.is_dir());
    }
}
