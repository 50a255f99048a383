//! Global hotkey handling
//!
//! Watches OS key events for a configured key or combination. When the
//! combination goes down, the press is claimed through the hotkey
//! exclusivity lock so that only one running server acts on it, and the
//! press handler runs on its own thread.
//!
//! Key events come from a [`KeySource`]; the default one is built on
//! `rdev` (see [`listener`]). On Linux this needs an X11 session or
//! XWayland; on macOS the Accessibility permission.

pub mod listener;

use crate::config::HotkeyConfig;
use crate::error::HotkeyError;
use crate::lock::{hotkey::hold_duration_for, HotkeyLockManager};
use rdev::Key;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A raw key transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyEvent {
    Press(Key),
    Release(Key),
}

pub type KeySink = Arc<dyn Fn(&KeyEvent) + Send + Sync>;

/// Handler run for each claimed press
pub type PressHandler = Arc<dyn Fn() + Send + Sync>;

/// Live registration with a key source. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Producer of key events
pub trait KeySource: Send + Sync {
    fn subscribe(&self, sink: KeySink) -> Result<Subscription, HotkeyError>;

    /// Failure reported by the underlying event hook, if any
    fn last_error(&self) -> Option<String> {
        None
    }
}

/// Key source driven by the caller, for scripted input and tests
#[derive(Default)]
pub struct ManualKeySource {
    sinks: Arc<Mutex<Vec<(u64, KeySink)>>>,
    next_id: AtomicU64,
}

impl ManualKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: KeyEvent) {
        let sinks: Vec<KeySink> = self
            .sinks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();
        for sink in sinks {
            sink(&event);
        }
    }

    /// Press and release every key of `hotkey`
    pub fn tap(&self, hotkey: &Hotkey) {
        let keys: Vec<Key> = hotkey.slots.iter().map(|slot| slot[0]).collect();
        for key in &keys {
            self.emit(KeyEvent::Press(*key));
        }
        for key in keys.iter().rev() {
            self.emit(KeyEvent::Release(*key));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl KeySource for ManualKeySource {
    fn subscribe(&self, sink: KeySink) -> Result<Subscription, HotkeyError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sinks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, sink));
        let sinks = Arc::clone(&self.sinks);
        Ok(Subscription::new(move || {
            sinks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .retain(|(other, _)| *other != id);
        }))
    }
}

/// A parsed key or key combination
///
/// Each slot is satisfied by any one of its keys, so `ctrl` matches
/// either control key.
#[derive(Debug, Clone, PartialEq)]
pub struct Hotkey {
    name: String,
    slots: Vec<Vec<Key>>,
}

impl Hotkey {
    /// Parse names like `menu`, `F12`, `scroll_lock` or `ctrl+alt+s`
    pub fn parse(name: &str) -> Result<Self, HotkeyError> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(HotkeyError::Empty);
        }

        let slots = name
            .split('+')
            .map(|part| parse_key_name(part).ok_or_else(|| HotkeyError::UnknownKey(part.trim().to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { name, slots })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn involves(&self, key: Key) -> bool {
        self.slots.iter().any(|slot| slot.contains(&key))
    }

    fn is_down(&self, pressed: &[Key]) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.iter().any(|key| pressed.contains(key)))
    }
}

#[cfg(target_os = "linux")]
const MENU_KEY: Key = Key::Unknown(135);
#[cfg(target_os = "windows")]
const MENU_KEY: Key = Key::Unknown(93);

/// Keys accepted for one slot of a hotkey name
fn parse_key_name(name: &str) -> Option<Vec<Key>> {
    let normalized: String = name
        .trim()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .collect();

    let single = |key: Key| Some(vec![key]);
    match normalized.as_str() {
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        "menu" | "apps" | "contextmenu" => single(MENU_KEY),

        "f1" => single(Key::F1),
        "f2" => single(Key::F2),
        "f3" => single(Key::F3),
        "f4" => single(Key::F4),
        "f5" => single(Key::F5),
        "f6" => single(Key::F6),
        "f7" => single(Key::F7),
        "f8" => single(Key::F8),
        "f9" => single(Key::F9),
        "f10" => single(Key::F10),
        "f11" => single(Key::F11),
        "f12" => single(Key::F12),

        // Modifiers match either side unless one is named
        "ctrl" | "control" => Some(vec![Key::ControlLeft, Key::ControlRight]),
        "leftctrl" | "lctrl" => single(Key::ControlLeft),
        "rightctrl" | "rctrl" => single(Key::ControlRight),
        "shift" => Some(vec![Key::ShiftLeft, Key::ShiftRight]),
        "leftshift" | "lshift" => single(Key::ShiftLeft),
        "rightshift" | "rshift" => single(Key::ShiftRight),
        "alt" | "option" | "leftalt" | "lalt" => single(Key::Alt),
        "altgr" | "rightalt" | "ralt" => single(Key::AltGr),
        "super" | "meta" | "cmd" | "command" | "win" => Some(vec![Key::MetaLeft, Key::MetaRight]),

        "pause" | "break" => single(Key::Pause),
        "scrolllock" => single(Key::ScrollLock),
        "capslock" => single(Key::CapsLock),
        "numlock" => single(Key::NumLock),
        "insert" => single(Key::Insert),
        "printscreen" | "print" => single(Key::PrintScreen),
        "space" => single(Key::Space),
        "tab" => single(Key::Tab),
        "escape" | "esc" => single(Key::Escape),
        "enter" | "return" => single(Key::Return),
        "backspace" => single(Key::Backspace),
        "delete" | "del" => single(Key::Delete),
        "home" => single(Key::Home),
        "end" => single(Key::End),
        "pageup" => single(Key::PageUp),
        "pagedown" => single(Key::PageDown),
        "up" => single(Key::UpArrow),
        "down" => single(Key::DownArrow),
        "left" => single(Key::LeftArrow),
        "right" => single(Key::RightArrow),

        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => char_key(c).map(|key| vec![key]),
                _ => None,
            }
        }
    }
}

fn char_key(c: char) -> Option<Key> {
    let key = match c {
        'a' => Key::KeyA,
        'b' => Key::KeyB,
        'c' => Key::KeyC,
        'd' => Key::KeyD,
        'e' => Key::KeyE,
        'f' => Key::KeyF,
        'g' => Key::KeyG,
        'h' => Key::KeyH,
        'i' => Key::KeyI,
        'j' => Key::KeyJ,
        'k' => Key::KeyK,
        'l' => Key::KeyL,
        'm' => Key::KeyM,
        'n' => Key::KeyN,
        'o' => Key::KeyO,
        'p' => Key::KeyP,
        'q' => Key::KeyQ,
        'r' => Key::KeyR,
        's' => Key::KeyS,
        't' => Key::KeyT,
        'u' => Key::KeyU,
        'v' => Key::KeyV,
        'w' => Key::KeyW,
        'x' => Key::KeyX,
        'y' => Key::KeyY,
        'z' => Key::KeyZ,
        '0' => Key::Num0,
        '1' => Key::Num1,
        '2' => Key::Num2,
        '3' => Key::Num3,
        '4' => Key::Num4,
        '5' => Key::Num5,
        '6' => Key::Num6,
        '7' => Key::Num7,
        '8' => Key::Num8,
        '9' => Key::Num9,
        _ => return None,
    };
    Some(key)
}

/// Press bookkeeping and dispatch for one monitored hotkey
struct Trigger {
    hotkey: Hotkey,
    lock: Option<Arc<HotkeyLockManager>>,
    handler: PressHandler,
    pressed: Mutex<Vec<Key>>,
    /// Set while the combination is held so key repeat does not re-fire
    latched: AtomicBool,
    processing: Arc<AtomicBool>,
    presses: AtomicU64,
    forfeited: AtomicU64,
}

impl Trigger {
    fn handle(&self, event: &KeyEvent) {
        match *event {
            KeyEvent::Press(key) => {
                if !self.hotkey.involves(key) {
                    return;
                }
                let down = {
                    let mut pressed = self.pressed.lock().unwrap_or_else(|p| p.into_inner());
                    if !pressed.contains(&key) {
                        pressed.push(key);
                    }
                    self.hotkey.is_down(&pressed)
                };
                if down && !self.latched.swap(true, Ordering::SeqCst) {
                    self.fire();
                }
            }
            KeyEvent::Release(key) => {
                if !self.hotkey.involves(key) {
                    return;
                }
                self.pressed
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .retain(|k| *k != key);
                self.latched.store(false, Ordering::SeqCst);
            }
        }
    }

    fn fire(&self) {
        self.presses.fetch_add(1, Ordering::SeqCst);

        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Hotkey '{}' pressed while still processing, ignoring", self.hotkey.name());
            return;
        }

        if let Some(lock) = &self.lock {
            if !lock.try_acquire_for_processing() {
                self.forfeited.fetch_add(1, Ordering::SeqCst);
                self.processing.store(false, Ordering::SeqCst);
                tracing::debug!("Hotkey '{}' claimed by another instance", self.hotkey.name());
                return;
            }
        }

        let handler = Arc::clone(&self.handler);
        let name = self.hotkey.name().to_string();
        // The lock is left to its self-release timer: other instances may
        // receive this same press late and must still find it claimed
        let finish = {
            let processing = Arc::clone(&self.processing);
            move || processing.store(false, Ordering::SeqCst)
        };

        tracing::info!("Hotkey '{}' pressed", name);
        let spawned = std::thread::Builder::new()
            .name("hotkey-dispatch".to_string())
            .spawn({
                let finish = finish.clone();
                move || {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler())) {
                        tracing::error!(
                            "Hotkey handler for '{}' panicked: {}",
                            name,
                            crate::loading::panic_message(panic.as_ref())
                        );
                    }
                    finish();
                }
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to dispatch hotkey press: {}", e);
            finish();
        }
    }
}

struct Monitor {
    trigger: Arc<Trigger>,
    _subscription: Subscription,
}

/// Status report for the hotkey tools
#[derive(Debug, Clone, Serialize)]
pub struct HotkeyStatus {
    pub monitoring: bool,
    pub hotkey: Option<String>,
    /// "file", "semaphore", or absent when unprotected
    pub lock: Option<String>,
    pub lock_held: bool,
    pub processing: bool,
    pub presses: u64,
    pub forfeited: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener_error: Option<String>,
}

/// Monitors one hotkey at a time
pub struct HotkeyManager {
    config: HotkeyConfig,
    lock_dir: PathBuf,
    hold_duration: Duration,
    source: Arc<dyn KeySource>,
    active: Mutex<Option<Monitor>>,
}

impl HotkeyManager {
    /// Manager using the OS key hook
    pub fn new(config: HotkeyConfig, lock_dir: PathBuf, silence_threshold: Duration) -> Self {
        Self::with_source(config, lock_dir, silence_threshold, listener::global())
    }

    pub fn with_source(
        config: HotkeyConfig,
        lock_dir: PathBuf,
        silence_threshold: Duration,
        source: Arc<dyn KeySource>,
    ) -> Self {
        Self {
            config,
            lock_dir,
            hold_duration: hold_duration_for(silence_threshold),
            source,
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<Monitor>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &HotkeyConfig {
        &self.config
    }

    /// Start watching `name` (or the configured hotkey)
    pub fn start_monitoring(&self, name: Option<&str>, handler: PressHandler) -> Result<(), HotkeyError> {
        let mut active = self.active();
        if let Some(monitor) = active.as_ref() {
            return Err(HotkeyError::AlreadyMonitoring(monitor.trigger.hotkey.name().to_string()));
        }

        let hotkey = Hotkey::parse(name.unwrap_or(&self.config.name))?;
        let lock = if self.config.lock_enabled {
            Some(Arc::new(HotkeyLockManager::new(
                hotkey.name(),
                &self.lock_dir,
                self.config.lock_fallback_semaphore,
                self.hold_duration,
            )))
        } else {
            tracing::warn!("Hotkey lock disabled, every running instance will act on '{}'", hotkey.name());
            None
        };

        let trigger = Arc::new(Trigger {
            hotkey,
            lock,
            handler,
            pressed: Mutex::new(Vec::new()),
            latched: AtomicBool::new(false),
            processing: Arc::new(AtomicBool::new(false)),
            presses: AtomicU64::new(0),
            forfeited: AtomicU64::new(0),
        });

        let sink_trigger = Arc::clone(&trigger);
        let subscription = self
            .source
            .subscribe(Arc::new(move |event: &KeyEvent| sink_trigger.handle(event)))?;

        tracing::info!("Monitoring hotkey '{}'", trigger.hotkey.name());
        *active = Some(Monitor {
            trigger,
            _subscription: subscription,
        });
        Ok(())
    }

    /// Stop watching. Returns false when nothing was monitored.
    pub fn stop_monitoring(&self) -> bool {
        let monitor = self.active().take();
        match monitor {
            Some(monitor) => {
                let trigger = monitor.trigger;
                drop(monitor._subscription);
                if let Some(lock) = &trigger.lock {
                    lock.cleanup();
                }
                tracing::info!("Stopped monitoring hotkey '{}'", trigger.hotkey.name());
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.active().is_some()
    }

    pub fn status(&self) -> HotkeyStatus {
        let listener_error = self.source.last_error();
        match self.active().as_ref() {
            Some(monitor) => {
                let trigger = &monitor.trigger;
                HotkeyStatus {
                    monitoring: true,
                    hotkey: Some(trigger.hotkey.name().to_string()),
                    lock: trigger
                        .lock
                        .as_ref()
                        .and_then(|l| l.lock_kind())
                        .map(|kind| kind.to_string()),
                    lock_held: trigger.lock.as_ref().is_some_and(|l| l.is_locked_by_me()),
                    processing: trigger.processing.load(Ordering::SeqCst),
                    presses: trigger.presses.load(Ordering::SeqCst),
                    forfeited: trigger.forfeited.load(Ordering::SeqCst),
                    listener_error,
                }
            }
            None => HotkeyStatus {
                monitoring: false,
                hotkey: None,
                lock: None,
                lock_held: false,
                processing: false,
                presses: 0,
                forfeited: 0,
                listener_error,
            },
        }
    }
}

impl Drop for HotkeyManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}
