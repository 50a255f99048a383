//! Hotkey exclusivity tests
//!
//! Several coordinators bound to the same hotkey and lock directory stand
//! in for several voice-mcp processes; exactly one of them may claim a
//! press.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use voice_mcp::config::HotkeyConfig;
use voice_mcp::hotkey::{Hotkey, HotkeyManager, ManualKeySource, PressHandler};
use voice_mcp::lock::{lock_path, HotkeyLockManager, LockKind};

const HOLD: Duration = Duration::from_secs(30);

fn coordinator(dir: &std::path::Path, hold: Duration) -> HotkeyLockManager {
    HotkeyLockManager::new("ctrl+alt+s", dir, false, hold)
}

// ============================================================================
// Lock coordinators
// ============================================================================

#[test]
fn concurrent_acquire_has_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let managers: Vec<Arc<HotkeyLockManager>> = (0..5)
        .map(|_| Arc::new(coordinator(dir.path(), HOLD)))
        .collect();
    assert!(managers.iter().all(|m| m.lock_kind() == Some(LockKind::File)));

    let barrier = Arc::new(Barrier::new(managers.len()));
    let handles: Vec<_> = managers
        .iter()
        .map(|manager| {
            let manager = Arc::clone(manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.try_acquire_for_processing()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    let holders = managers.iter().filter(|m| m.is_locked_by_me()).count();
    assert_eq!(holders, 1);
}

#[test]
fn lock_file_is_named_after_hotkey() {
    let dir = tempfile::tempdir().unwrap();
    let manager = coordinator(dir.path(), HOLD);
    assert!(manager.try_acquire_for_processing());
    assert!(lock_path(dir.path(), "ctrl+alt+s").ends_with("hotkey-ctrl-alt-s.lock"));
    assert!(lock_path(dir.path(), "ctrl+alt+s").exists());
}

#[test]
fn release_hands_lock_to_next_instance() {
    let dir = tempfile::tempdir().unwrap();
    let first = coordinator(dir.path(), HOLD);
    let second = coordinator(dir.path(), HOLD);

    assert!(first.try_acquire_for_processing());
    assert!(!second.try_acquire_for_processing());

    assert!(first.release_immediate());
    assert!(first.release_immediate());
    assert!(!first.is_locked_by_me());

    assert!(second.try_acquire_for_processing());
    assert!(!first.try_acquire_for_processing());
}

#[test]
fn holder_does_not_reacquire_its_own_lock() {
    let dir = tempfile::tempdir().unwrap();
    let manager = coordinator(dir.path(), HOLD);
    assert!(manager.try_acquire_for_processing());
    assert!(!manager.try_acquire_for_processing());
    assert!(manager.is_locked_by_me());
}

#[test]
fn held_lock_is_released_after_hold_duration() {
    let dir = tempfile::tempdir().unwrap();
    let crashed = coordinator(dir.path(), Duration::from_millis(100));
    let other = coordinator(dir.path(), HOLD);

    assert!(crashed.try_acquire_for_processing());
    assert!(!other.try_acquire_for_processing());

    let deadline = Instant::now() + Duration::from_secs(5);
    while crashed.is_locked_by_me() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!crashed.is_locked_by_me());
    assert!(other.try_acquire_for_processing());
}

#[test]
fn dropping_holder_frees_lock() {
    let dir = tempfile::tempdir().unwrap();
    let holder = coordinator(dir.path(), HOLD);
    assert!(holder.try_acquire_for_processing());
    drop(holder);

    let next = coordinator(dir.path(), HOLD);
    assert!(next.try_acquire_for_processing());
}

// ============================================================================
// Hotkey managers sharing one key source
// ============================================================================

fn hotkey_config() -> HotkeyConfig {
    HotkeyConfig {
        name: "f9".to_string(),
        lock_enabled: true,
        lock_fallback_semaphore: false,
        ..HotkeyConfig::default()
    }
}

#[test]
fn one_press_dispatches_once_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ManualKeySource::new());

    let dispatched = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);

    let handler: PressHandler = {
        let dispatched = Arc::clone(&dispatched);
        Arc::new(move || {
            dispatched.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.lock().unwrap().send(());
            let _ = gate_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        })
    };

    let managers: Vec<HotkeyManager> = (0..3)
        .map(|_| {
            let manager = HotkeyManager::with_source(
                hotkey_config(),
                dir.path().to_path_buf(),
                Duration::from_secs(1),
                source.clone(),
            );
            manager.start_monitoring(None, handler.clone()).unwrap();
            manager
        })
        .collect();
    assert_eq!(source.subscriber_count(), 3);

    source.tap(&Hotkey::parse("f9").unwrap());
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(started_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(dispatched.load(Ordering::SeqCst), 1);

    let statuses: Vec<_> = managers.iter().map(|m| m.status()).collect();
    assert!(statuses.iter().all(|s| s.presses == 1));
    assert_eq!(statuses.iter().map(|s| s.forfeited).sum::<u64>(), 2);
    assert_eq!(statuses.iter().filter(|s| s.lock_held).count(), 1);

    gate_tx.send(()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while managers.iter().any(|m| m.status().processing) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    // Finishing the handler does not give the press away
    assert_eq!(managers.iter().filter(|m| m.status().lock_held).count(), 1);

    for manager in &managers {
        assert!(manager.stop_monitoring());
    }
    assert_eq!(source.subscriber_count(), 0);
    assert!(HotkeyLockManager::new("f9", dir.path(), false, HOLD).try_acquire_for_processing());
}

#[test]
fn late_delivery_of_same_press_is_forfeited_after_fast_handler() {
    let dir = tempfile::tempdir().unwrap();
    let dispatched = Arc::new(AtomicUsize::new(0));
    let handler: PressHandler = {
        let dispatched = Arc::clone(&dispatched);
        Arc::new(move || {
            dispatched.fetch_add(1, Ordering::SeqCst);
        })
    };

    // Two processes, each with its own OS key hook
    let sources: Vec<Arc<ManualKeySource>> = (0..2).map(|_| Arc::new(ManualKeySource::new())).collect();
    let managers: Vec<HotkeyManager> = sources
        .iter()
        .map(|source| {
            let manager = HotkeyManager::with_source(
                hotkey_config(),
                dir.path().to_path_buf(),
                Duration::from_secs(1),
                source.clone(),
            );
            manager.start_monitoring(None, handler.clone()).unwrap();
            manager
        })
        .collect();

    let hotkey = Hotkey::parse("f9").unwrap();
    sources[0].tap(&hotkey);
    let deadline = Instant::now() + Duration::from_secs(5);
    while (dispatched.load(Ordering::SeqCst) == 0 || managers[0].status().processing)
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!managers[0].status().processing);

    thread::sleep(Duration::from_millis(50));
    sources[1].tap(&hotkey);
    thread::sleep(Duration::from_millis(100));

    assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    assert_eq!(managers[1].status().forfeited, 1);
    assert!(managers[0].status().lock_held);
}
