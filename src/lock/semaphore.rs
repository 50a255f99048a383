//! In-process fallback lock
//!
//! A capacity-1 slot per lock name, shared by every `SemaphoreLock` in the
//! process. Two voice-mcp processes each get their own registry, so this
//! only prevents double-processing within one process.

use super::{CrossPlatformLock, LockKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

fn registry() -> &'static Mutex<HashMap<String, Arc<AtomicBool>>> {
    static SLOTS: OnceLock<Mutex<HashMap<String, Arc<AtomicBool>>>> = OnceLock::new();
    SLOTS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn slot_for(name: &str) -> Arc<AtomicBool> {
    let mut slots = registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(
        slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false))),
    )
}

pub struct SemaphoreLock {
    name: String,
    taken: Arc<AtomicBool>,
    held: bool,
}

impl SemaphoreLock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            taken: slot_for(name),
            held: false,
        }
    }
}

impl CrossPlatformLock for SemaphoreLock {
    fn try_acquire_immediate(&mut self) -> bool {
        if self.held {
            return false;
        }
        if self
            .taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.held = true;
            tracing::debug!("Acquired semaphore lock '{}'", self.name);
            true
        } else {
            false
        }
    }

    fn release_immediate(&mut self) -> bool {
        if self.held {
            self.held = false;
            self.taken.store(false, Ordering::Release);
            tracing::debug!("Released semaphore lock '{}'", self.name);
        }
        true
    }

    fn is_locked_by_me(&self) -> bool {
        self.held
    }

    fn kind(&self) -> LockKind {
        LockKind::Semaphore
    }
}

impl Drop for SemaphoreLock {
    fn drop(&mut self) {
        self.release_immediate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_holder_per_name() {
        let mut a = SemaphoreLock::new("test-sem-single");
        let mut b = SemaphoreLock::new("test-sem-single");

        assert!(a.try_acquire_immediate());
        assert!(!b.try_acquire_immediate());
        assert!(a.is_locked_by_me());
        assert!(!b.is_locked_by_me());

        assert!(a.release_immediate());
        assert!(b.try_acquire_immediate());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut a = SemaphoreLock::new("test-sem-idempotent");
        assert!(a.try_acquire_immediate());
        assert!(a.release_immediate());
        assert!(a.release_immediate());
        assert!(!a.is_locked_by_me());
    }

    #[test]
    fn test_drop_releases() {
        {
            let mut a = SemaphoreLock::new("test-sem-drop");
            assert!(a.try_acquire_immediate());
        }
        let mut b = SemaphoreLock::new("test-sem-drop");
        assert!(b.try_acquire_immediate());
    }
}
