//! Cross-process mutual exclusion for hotkey handling
//!
//! Several voice-mcp instances can be bound to the same global hotkey.
//! Each press must be handled by exactly one of them, so instances race
//! for a lock named after the hotkey:
//! - [`file::FileLock`]: an advisory `flock(2)` on a file in the runtime
//!   directory, holding the owner pid and acquisition time
//! - [`semaphore::SemaphoreLock`]: a process-local fallback used when file
//!   locking can't be set up. It cannot exclude other processes.
//!
//! [`hotkey::HotkeyLockManager`] wraps one of these with a self-release
//! timer.

#[cfg(unix)]
pub mod file;
pub mod hotkey;
pub mod semaphore;

pub use hotkey::HotkeyLockManager;

use std::path::{Path, PathBuf};

/// Which primitive backs a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    File,
    Semaphore,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::File => write!(f, "file"),
            LockKind::Semaphore => write!(f, "semaphore"),
        }
    }
}

/// Non-blocking exclusive lock
///
/// None of the operations block or panic. Failures to acquire are reported
/// as `false`; failures during release are logged and the lock is still
/// considered released.
pub trait CrossPlatformLock: Send {
    /// Try to take the lock without waiting
    fn try_acquire_immediate(&mut self) -> bool;

    /// Give the lock up. Releasing a lock that isn't held returns true.
    fn release_immediate(&mut self) -> bool;

    /// Whether this instance currently holds the lock
    fn is_locked_by_me(&self) -> bool;

    /// Release everything held by this instance
    fn cleanup(&mut self) {
        self.release_immediate();
    }

    fn kind(&self) -> LockKind;
}

/// Lock file name for a hotkey, e.g. `hotkey-ctrl-alt-s.lock`
pub fn lock_file_name(hotkey_name: &str) -> String {
    format!("hotkey-{}.lock", hotkey_name.replace('+', "-"))
}

/// Full lock path for a hotkey inside `lock_dir`
pub fn lock_path(lock_dir: &Path, hotkey_name: &str) -> PathBuf {
    lock_dir.join(lock_file_name(hotkey_name))
}

/// Build the best available lock for a hotkey
///
/// Returns `None` when neither variant can be used; callers then proceed
/// without protection.
pub fn create_lock(
    lock_dir: &Path,
    hotkey_name: &str,
    allow_semaphore: bool,
) -> Option<Box<dyn CrossPlatformLock>> {
    #[cfg(unix)]
    {
        match file::FileLock::new(lock_path(lock_dir, hotkey_name)) {
            Ok(lock) => {
                tracing::debug!("Using file lock at {:?}", lock.path());
                return Some(Box::new(lock));
            }
            Err(e) => {
                tracing::warn!("File lock unavailable for hotkey '{}': {}", hotkey_name, e);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = lock_dir;
        tracing::warn!(
            "File lock unavailable for hotkey '{}': {}",
            hotkey_name,
            crate::error::LockError::Unsupported
        );
    }

    if allow_semaphore {
        tracing::warn!(
            "Falling back to in-process semaphore for hotkey '{}'. \
             Other voice-mcp processes may handle the same press.",
            hotkey_name
        );
        Some(Box::new(semaphore::SemaphoreLock::new(hotkey_name)))
    } else {
        None
    }
}
