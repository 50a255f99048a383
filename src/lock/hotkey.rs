//! Hotkey exclusivity coordinator
//!
//! Decides whether this process handles a given hotkey press. A granted
//! press holds the lock until [`HotkeyLockManager::release_immediate`] or
//! until the self-release timer fires, so a crash mid-dictation can't
//! block the hotkey for other instances forever.

use super::{create_lock, CrossPlatformLock, LockKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Added to the silence threshold when sizing the hold
const HOLD_MARGIN: Duration = Duration::from_secs(2);

/// Minimum hold
const MIN_HOLD: Duration = Duration::from_secs(6);

/// How long release waits for the timer thread to wind down
const TIMER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Hold duration for a dictation ending after `silence_threshold`
pub fn hold_duration_for(silence_threshold: Duration) -> Duration {
    silence_threshold.saturating_add(HOLD_MARGIN).max(MIN_HOLD)
}

struct ReleaseTimer {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

impl ReleaseTimer {
    fn stop(self) {
        let _ = self.cancel.send(());
        let deadline = Instant::now() + TIMER_JOIN_TIMEOUT;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::debug!("Hotkey release timer did not stop in time, detaching");
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let _ = self.handle.join();
    }
}

struct LockState {
    lock: Option<Box<dyn CrossPlatformLock>>,
    timer: Option<ReleaseTimer>,
    /// Bumped on every acquire and release so a stale timer does nothing
    generation: u64,
}

/// Per-hotkey exclusivity lock with a self-release timer
pub struct HotkeyLockManager {
    hotkey_name: String,
    hold_duration: Duration,
    state: Arc<Mutex<LockState>>,
}

impl HotkeyLockManager {
    /// Create a coordinator for `hotkey_name` using locks in `lock_dir`
    ///
    /// Never fails: without a usable lock every press is granted and a
    /// warning is logged.
    pub fn new(
        hotkey_name: &str,
        lock_dir: &Path,
        allow_semaphore: bool,
        hold_duration: Duration,
    ) -> Self {
        let lock = create_lock(lock_dir, hotkey_name, allow_semaphore);
        Self::with_lock(hotkey_name, lock, hold_duration)
    }

    /// Create a coordinator around an existing lock
    pub fn with_lock(
        hotkey_name: &str,
        lock: Option<Box<dyn CrossPlatformLock>>,
        hold_duration: Duration,
    ) -> Self {
        Self {
            hotkey_name: hotkey_name.to_string(),
            hold_duration,
            state: Arc::new(Mutex::new(LockState {
                lock,
                timer: None,
                generation: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn hotkey_name(&self) -> &str {
        &self.hotkey_name
    }

    pub fn hold_duration(&self) -> Duration {
        self.hold_duration
    }

    /// Lock backing this coordinator, if any
    pub fn lock_kind(&self) -> Option<LockKind> {
        self.state().lock.as_ref().map(|l| l.kind())
    }

    /// Claim the current press
    ///
    /// Returns false without side effects when another holder (another
    /// process, or a press this process is still handling) has the lock.
    pub fn try_acquire_for_processing(&self) -> bool {
        let mut state = self.state();

        let Some(lock) = state.lock.as_mut() else {
            tracing::warn!(
                "No lock available for hotkey '{}', processing anyway",
                self.hotkey_name
            );
            return true;
        };

        if lock.is_locked_by_me() {
            tracing::debug!(
                "Hotkey '{}' is already being processed here",
                self.hotkey_name
            );
            return false;
        }

        if !lock.try_acquire_immediate() {
            tracing::debug!(
                "Hotkey '{}' is being handled by another instance",
                self.hotkey_name
            );
            return false;
        }

        state.generation += 1;
        let generation = state.generation;

        match self.spawn_release_timer(generation) {
            Ok(timer) => {
                let stale = state.timer.replace(timer);
                drop(state);
                if let Some(stale) = stale {
                    let _ = stale.cancel.send(());
                }
                tracing::debug!(
                    "Acquired hotkey lock '{}' (auto-release in {:?})",
                    self.hotkey_name,
                    self.hold_duration
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Cannot start release timer for hotkey '{}': {}",
                    self.hotkey_name,
                    e
                );
                if let Some(lock) = state.lock.as_mut() {
                    lock.release_immediate();
                }
                false
            }
        }
    }

    fn spawn_release_timer(&self, generation: u64) -> std::io::Result<ReleaseTimer> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let state: Weak<Mutex<LockState>> = Arc::downgrade(&self.state);
        let hold = self.hold_duration;
        let name = self.hotkey_name.clone();

        let handle = thread::Builder::new()
            .name("hotkey-lock-release".to_string())
            .spawn(move || {
                if cancelled.recv_timeout(hold) != Err(RecvTimeoutError::Timeout) {
                    return;
                }
                let Some(state) = state.upgrade() else {
                    return;
                };
                let mut state = state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if state.generation != generation {
                    return;
                }
                state.timer = None;
                if let Some(lock) = state.lock.as_mut() {
                    let released = catch_unwind(AssertUnwindSafe(|| lock.release_immediate()));
                    if released.is_err() {
                        tracing::error!("Panic while auto-releasing hotkey lock '{}'", name);
                    }
                }
                tracing::info!("Auto-released hotkey lock '{}' after {:?}", name, hold);
            })?;

        Ok(ReleaseTimer { cancel, handle })
    }

    /// Stop the release timer and give the lock up. Idempotent.
    pub fn release_immediate(&self) -> bool {
        let (timer, released) = {
            let mut state = self.state();
            state.generation += 1;
            let timer = state.timer.take();
            let released = match state.lock.as_mut() {
                Some(lock) => {
                    let held = lock.is_locked_by_me();
                    let released = lock.release_immediate();
                    if held {
                        tracing::debug!("Released hotkey lock '{}'", self.hotkey_name);
                    }
                    released
                }
                None => true,
            };
            (timer, released)
        };

        if let Some(timer) = timer {
            timer.stop();
        }
        released
    }

    pub fn is_locked_by_me(&self) -> bool {
        self.state()
            .lock
            .as_ref()
            .map(|l| l.is_locked_by_me())
            .unwrap_or(false)
    }

    /// Release and tear down the underlying lock
    pub fn cleanup(&self) {
        self.release_immediate();
        if let Some(lock) = self.state().lock.as_mut() {
            lock.cleanup();
        }
    }
}

impl Drop for HotkeyLockManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::semaphore::SemaphoreLock;

    fn manager(dir: &Path, name: &str, hold: Duration) -> HotkeyLockManager {
        HotkeyLockManager::new(name, dir, true, hold)
    }

    #[test]
    fn test_hold_duration_floor_and_margin() {
        assert_eq!(hold_duration_for(Duration::from_secs(1)), MIN_HOLD);
        assert_eq!(
            hold_duration_for(Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert_eq!(
            hold_duration_for(Duration::from_secs(10)),
            Duration::from_secs(12)
        );
        assert_eq!(hold_duration_for(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn test_acquire_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), "menu", Duration::from_secs(30));

        assert!(m.try_acquire_for_processing());
        assert!(m.is_locked_by_me());
        assert!(m.release_immediate());
        assert!(!m.is_locked_by_me());
        assert!(m.release_immediate());
        assert!(!m.is_locked_by_me());
    }

    #[test]
    fn test_second_press_while_processing_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), "f12", Duration::from_secs(30));

        assert!(m.try_acquire_for_processing());
        assert!(!m.try_acquire_for_processing());
        m.release_immediate();
        assert!(m.try_acquire_for_processing());
    }

    #[test]
    fn test_self_release_timer_fires() {
        let dir = tempfile::tempdir().unwrap();
        let holder = manager(dir.path(), "pause", Duration::from_millis(100));
        let other = manager(dir.path(), "pause", Duration::from_millis(100));

        assert!(holder.try_acquire_for_processing());
        assert!(!other.try_acquire_for_processing());

        thread::sleep(Duration::from_millis(400));
        assert!(!holder.is_locked_by_me());
        assert!(other.try_acquire_for_processing());
    }

    #[test]
    fn test_release_cancels_timer() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), "ctrl+alt+s", Duration::from_millis(150));

        assert!(m.try_acquire_for_processing());
        m.release_immediate();
        assert!(m.try_acquire_for_processing());

        // The first grant's timer must not release the second grant early
        thread::sleep(Duration::from_millis(100));
        assert!(m.is_locked_by_me());
        m.release_immediate();
    }

    #[test]
    fn test_no_lock_processes_anyway() {
        let m = HotkeyLockManager::with_lock("menu", None, Duration::from_secs(6));
        assert!(m.try_acquire_for_processing());
        assert!(m.try_acquire_for_processing());
        assert!(!m.is_locked_by_me());
        assert!(m.release_immediate());
        assert_eq!(m.lock_kind(), None);
    }

    #[test]
    fn test_semaphore_backed_manager() {
        let m = HotkeyLockManager::with_lock(
            "sem-backed",
            Some(Box::new(SemaphoreLock::new("test-hotkey-sem-backed"))),
            Duration::from_secs(30),
        );
        assert_eq!(m.lock_kind(), Some(LockKind::Semaphore));
        assert!(m.try_acquire_for_processing());
        assert!(m.release_immediate());
    }
}
