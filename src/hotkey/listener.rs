//! OS key hook built on rdev
//!
//! `rdev::listen` blocks its thread for the life of the process and has no
//! stop call, so the hook is installed once and fans events out to the
//! current subscribers.

use super::{KeyEvent, KeySink, KeySource, Subscription};
use crate::error::HotkeyError;
use rdev::{listen, Event, EventType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

type Sinks = Arc<Mutex<Vec<(u64, KeySink)>>>;

/// Process-wide rdev hook
pub struct RdevKeySource {
    sinks: Sinks,
    next_id: AtomicU64,
    started: OnceLock<Result<(), String>>,
    error: Arc<Mutex<Option<String>>>,
}

/// The shared hook for this process
pub fn global() -> Arc<dyn KeySource> {
    static SOURCE: OnceLock<Arc<RdevKeySource>> = OnceLock::new();
    let source = SOURCE.get_or_init(|| {
        Arc::new(RdevKeySource {
            sinks: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
            started: OnceLock::new(),
            error: Arc::new(Mutex::new(None)),
        })
    });
    Arc::clone(source) as Arc<dyn KeySource>
}

impl RdevKeySource {
    fn ensure_started(&self) -> Result<(), HotkeyError> {
        let started = self.started.get_or_init(|| {
            let sinks = Arc::clone(&self.sinks);
            let error = Arc::clone(&self.error);
            std::thread::Builder::new()
                .name("key-listener".to_string())
                .spawn(move || {
                    let callback = move |event: Event| {
                        let key_event = match event.event_type {
                            EventType::KeyPress(key) => KeyEvent::Press(key),
                            EventType::KeyRelease(key) => KeyEvent::Release(key),
                            _ => return,
                        };
                        let current: Vec<KeySink> = sinks
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .iter()
                            .map(|(_, sink)| Arc::clone(sink))
                            .collect();
                        for sink in current {
                            sink(&key_event);
                        }
                    };

                    // Blocks until the hook fails
                    if let Err(e) = listen(callback) {
                        let message = format!("{:?}", e);
                        tracing::error!("Global key listener failed: {}", message);
                        tracing::warn!(
                            "Hotkeys need an X11/XWayland session on Linux or the \
                             Accessibility permission on macOS"
                        );
                        *error.lock().unwrap_or_else(|p| p.into_inner()) = Some(message);
                    }
                })
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        started.clone().map_err(HotkeyError::Listener)
    }
}

impl KeySource for RdevKeySource {
    fn subscribe(&self, sink: KeySink) -> Result<Subscription, HotkeyError> {
        self.ensure_started()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sinks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, sink));
        tracing::debug!("Key listener subscriber {} added", id);

        let sinks = Arc::clone(&self.sinks);
        Ok(Subscription::new(move || {
            sinks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .retain(|(other, _)| *other != id);
        }))
    }

    fn last_error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
