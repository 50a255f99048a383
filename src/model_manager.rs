//! Model cache for speech recognition
//!
//! Keeps at most `cache_size` recognizers loaded, keyed by model name:
//! - LRU eviction when a new model needs room
//! - Idle expiry by a background sweep
//! - One load per model name at a time; concurrent requesters wait for
//!   the running load instead of starting their own
//!
//! All bookkeeping lives behind one mutex. Model loads and releases run
//! outside of it.

use crate::config::SttConfig;
use crate::error::ModelError;
use crate::loading::panic_message;
use crate::transcribe::{estimate_memory_bytes, DeviceSpec, RecognizerFactory, SpeechRecognizer};
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cache sizing and timing
#[derive(Debug, Clone)]
pub struct ModelCacheSettings {
    pub cache_size: usize,
    pub model_timeout: Duration,
    pub sweep_interval: Duration,
    pub load_wait_timeout: Duration,
    pub preload_models: Vec<String>,
}

impl ModelCacheSettings {
    pub fn from_config(config: &SttConfig) -> Self {
        Self {
            cache_size: config.model_cache_size.max(1),
            model_timeout: Duration::from_secs(config.model_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            load_wait_timeout: Duration::from_secs(config.load_wait_timeout_secs),
            preload_models: config.preload_models.clone(),
        }
    }
}

/// A loaded model with usage tracking
struct CachedModel {
    recognizer: Arc<dyn SpeechRecognizer>,
    device: DeviceSpec,
    load_time: Duration,
    loaded_at: Instant,
    last_used: Instant,
    memory_estimate_bytes: u64,
}

/// One-shot completion signal for an in-flight load
struct LoadSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl LoadSignal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut done = self.done.lock().unwrap_or_else(|p| p.into_inner());
        *done = true;
        self.cond.notify_all();
    }

    /// Returns false if the timeout passed first
    fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap_or_else(|p| p.into_inner());
        let (done, _) = self
            .cond
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|p| p.into_inner());
        *done
    }
}

struct Sweeper {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

struct CacheState {
    running: bool,
    started_at: Option<Instant>,
    models: LruCache<String, CachedModel>,
    in_flight: HashMap<String, Arc<LoadSignal>>,
    sweeper: Option<Sweeper>,
}

/// Result of a successful preload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadOutcome {
    pub model: String,
    /// Already loaded (or loaded by a concurrent caller)
    pub cached: bool,
    pub load_time: Option<Duration>,
}

/// What `start` managed to preload
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    pub preloaded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedModelStatus {
    pub name: String,
    pub device: String,
    pub compute_type: String,
    pub load_time_secs: f64,
    pub age_secs: f64,
    pub idle_secs: f64,
    pub memory_estimate_mb: u64,
}

/// Snapshot of the cache for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ModelCacheStatus {
    pub running: bool,
    pub uptime_secs: f64,
    pub cache_size: usize,
    pub model_timeout_secs: u64,
    /// Most recently used first
    pub models: Vec<CachedModelStatus>,
    pub loading: Vec<String>,
    pub total_memory_estimate_mb: u64,
}

/// Removes the in-flight marker and wakes waiters on every exit path
struct InFlightGuard<'a> {
    state: &'a Mutex<CacheState>,
    name: String,
    signal: Arc<LoadSignal>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = lock_state(self.state);
            if let Some(current) = state.in_flight.get(&self.name) {
                if Arc::ptr_eq(current, &self.signal) {
                    state.in_flight.remove(&self.name);
                }
            }
        }
        self.signal.notify();
    }
}

/// LRU cache of loaded speech-recognition models
pub struct ModelCacheManager {
    settings: ModelCacheSettings,
    factory: Arc<dyn RecognizerFactory>,
    state: Arc<Mutex<CacheState>>,
}

impl ModelCacheManager {
    pub fn new(settings: ModelCacheSettings, factory: Arc<dyn RecognizerFactory>) -> Self {
        let settings = ModelCacheSettings {
            cache_size: settings.cache_size.max(1),
            ..settings
        };
        Self {
            settings,
            factory,
            state: Arc::new(Mutex::new(CacheState {
                running: false,
                started_at: None,
                models: LruCache::unbounded(),
                in_flight: HashMap::new(),
                sweeper: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        lock_state(&self.state)
    }

    pub fn settings(&self) -> &ModelCacheSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Start the cache: launch the idle sweep and preload the configured models
    ///
    /// A model that fails to preload is reported and skipped. Calling
    /// start on a running cache does nothing.
    pub fn start(&self) -> StartReport {
        if !self.launch() {
            return StartReport::default();
        }
        self.preload_configured()
    }

    /// Mark the cache running and launch the idle sweep without loading
    /// anything. Returns false when it was already running.
    pub fn launch(&self) -> bool {
        {
            let mut state = self.state();
            if state.running {
                tracing::debug!("Model cache already running");
                return false;
            }
            state.running = true;
            state.started_at = Some(Instant::now());
            match spawn_sweeper(
                Arc::downgrade(&self.state),
                self.settings.sweep_interval,
                self.settings.model_timeout,
            ) {
                Ok(sweeper) => state.sweeper = Some(sweeper),
                Err(e) => tracing::warn!("Cannot start idle model sweep: {}", e),
            }
        }

        tracing::info!(
            "Model cache started (size={}, timeout={}s)",
            self.settings.cache_size,
            self.settings.model_timeout.as_secs()
        );
        true
    }

    /// Load every configured preload model. Blocks on the loads.
    pub fn preload_configured(&self) -> StartReport {
        let mut report = StartReport::default();
        for model in &self.settings.preload_models {
            match self.preload_model(model) {
                Ok(_) => report.preloaded.push(model.clone()),
                Err(e) => {
                    tracing::warn!("Failed to preload model '{}': {}", model, e);
                    report.failed.push((model.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Stop the sweep and unload every model. Idempotent.
    pub fn stop(&self) {
        let (sweeper, evicted, waiting) = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            state.running = false;
            state.started_at = None;
            let mut evicted = Vec::new();
            while let Some(entry) = state.models.pop_lru() {
                evicted.push(entry);
            }
            let waiting: Vec<Arc<LoadSignal>> =
                state.in_flight.drain().map(|(_, signal)| signal).collect();
            (state.sweeper.take(), evicted, waiting)
        };

        if let Some(sweeper) = sweeper {
            let _ = sweeper.cancel.send(());
            let _ = sweeper.handle.join();
        }
        for signal in waiting {
            signal.notify();
        }
        let count = evicted.len();
        release_all(evicted, "cache stopped");
        tracing::info!("Model cache stopped ({} model(s) unloaded)", count);
    }

    /// Make sure `name` is loaded
    ///
    /// A model already loading for another caller is waited for (up to the
    /// load wait timeout) instead of loaded twice.
    pub fn preload_model(&self, name: &str) -> Result<PreloadOutcome, ModelError> {
        enum Next {
            Wait(Arc<LoadSignal>),
            Load(Arc<LoadSignal>, Vec<(String, CachedModel)>),
        }

        let next = {
            let mut state = self.state();
            if !state.running {
                return Err(ModelError::NotRunning);
            }
            if let Some(entry) = state.models.get_mut(name) {
                entry.last_used = Instant::now();
                tracing::debug!("Model '{}' already cached", name);
                return Ok(PreloadOutcome {
                    model: name.to_string(),
                    cached: true,
                    load_time: None,
                });
            }
            match state.in_flight.get(name) {
                Some(signal) => Next::Wait(Arc::clone(signal)),
                None => {
                    let signal = Arc::new(LoadSignal::new());
                    state.in_flight.insert(name.to_string(), Arc::clone(&signal));
                    let evicted = make_room(&mut state, self.settings.cache_size);
                    Next::Load(signal, evicted)
                }
            }
        };

        match next {
            Next::Wait(signal) => self.wait_for_load(name, &signal),
            Next::Load(signal, evicted) => {
                release_all(evicted, "LRU");
                let guard = InFlightGuard {
                    state: &self.state,
                    name: name.to_string(),
                    signal,
                };
                let result = self.load(name);
                drop(guard);
                result
            }
        }
    }

    fn wait_for_load(&self, name: &str, signal: &LoadSignal) -> Result<PreloadOutcome, ModelError> {
        tracing::debug!("Model '{}' is being loaded by another caller, waiting", name);
        if !signal.wait(self.settings.load_wait_timeout) {
            tracing::warn!(
                "Timed out after {:?} waiting for model '{}'",
                self.settings.load_wait_timeout,
                name
            );
            return Err(ModelError::Timeout(name.to_string()));
        }

        let mut state = self.state();
        if !state.running {
            return Err(ModelError::NotRunning);
        }
        match state.models.get_mut(name) {
            Some(entry) => {
                entry.last_used = Instant::now();
                Ok(PreloadOutcome {
                    model: name.to_string(),
                    cached: true,
                    load_time: None,
                })
            }
            None => Err(ModelError::LoadFailed(
                name.to_string(),
                "concurrent load did not succeed".to_string(),
            )),
        }
    }

    fn load(&self, name: &str) -> Result<PreloadOutcome, ModelError> {
        let device = self.factory.device_for(name);
        tracing::info!(
            "Loading model '{}' (device={}, compute_type={})",
            name,
            device.device,
            device.compute_type
        );

        let started = Instant::now();
        let recognizer = match catch_unwind(AssertUnwindSafe(|| self.factory.create(name, &device))) {
            Ok(Ok(recognizer)) => recognizer,
            Ok(Err(e)) => {
                tracing::error!("Failed to load model '{}': {}", name, e);
                return Err(ModelError::LoadFailed(name.to_string(), e.to_string()));
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Panic while loading model '{}': {}", name, message);
                return Err(ModelError::LoadFailed(name.to_string(), message));
            }
        };
        let load_time = started.elapsed();

        let now = Instant::now();
        let entry = CachedModel {
            recognizer,
            memory_estimate_bytes: estimate_memory_bytes(name, &device),
            device,
            load_time,
            loaded_at: now,
            last_used: now,
        };

        let evicted = {
            let mut state = self.state();
            if !state.running {
                drop(state);
                release_all(vec![(name.to_string(), entry)], "cache stopped");
                return Err(ModelError::NotRunning);
            }
            let evicted = make_room(&mut state, self.settings.cache_size);
            state.models.put(name.to_string(), entry);
            evicted
        };
        release_all(evicted, "LRU");

        tracing::info!("Model '{}' loaded in {:.2?}", name, load_time);
        Ok(PreloadOutcome {
            model: name.to_string(),
            cached: false,
            load_time: Some(load_time),
        })
    }

    /// Cached recognizer for `name`, loading it if needed
    pub fn get_model_recorder(&self, name: &str) -> Option<Arc<dyn SpeechRecognizer>> {
        if let Some(recognizer) = self.touch(name) {
            return Some(recognizer);
        }

        match self.preload_model(name) {
            Ok(_) => self.touch(name),
            Err(e) => {
                tracing::warn!("Model '{}' unavailable: {}", name, e);
                None
            }
        }
    }

    fn touch(&self, name: &str) -> Option<Arc<dyn SpeechRecognizer>> {
        let mut state = self.state();
        state.models.get_mut(name).map(|entry| {
            entry.last_used = Instant::now();
            Arc::clone(&entry.recognizer)
        })
    }

    /// Load a model ahead of use and mark it recently used
    pub fn warm_model(&self, name: &str) -> bool {
        match self.preload_model(name) {
            Ok(_) => self.touch(name).is_some(),
            Err(e) => {
                tracing::warn!("Failed to warm model '{}': {}", name, e);
                false
            }
        }
    }

    /// Unload one model. Absent models are a no-op.
    pub fn unload_model(&self, name: &str) -> bool {
        let removed = self.state().models.pop(name);
        if let Some(entry) = removed {
            release_all(vec![(name.to_string(), entry)], "unload requested");
        }
        true
    }

    /// Unload models idle for longer than the model timeout
    ///
    /// Run by the sweep thread; returns the unloaded names.
    pub fn cleanup_expired_models(&self) -> Vec<String> {
        expire_idle(&self.state, self.settings.model_timeout)
    }

    /// Loaded model names, least recently used first
    pub fn loaded_model_names(&self) -> Vec<String> {
        self.state()
            .models
            .iter()
            .rev()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state().models.contains(name)
    }

    pub fn get_status(&self) -> ModelCacheStatus {
        let state = self.state();
        let now = Instant::now();
        let models: Vec<CachedModelStatus> = state
            .models
            .iter()
            .map(|(name, entry)| CachedModelStatus {
                name: name.clone(),
                device: entry.device.device.clone(),
                compute_type: entry.device.compute_type.clone(),
                load_time_secs: entry.load_time.as_secs_f64(),
                age_secs: now.duration_since(entry.loaded_at).as_secs_f64(),
                idle_secs: now.duration_since(entry.last_used).as_secs_f64(),
                memory_estimate_mb: entry.memory_estimate_bytes / (1024 * 1024),
            })
            .collect();
        let total_memory_estimate_mb = models.iter().map(|m| m.memory_estimate_mb).sum();
        let mut loading: Vec<String> = state.in_flight.keys().cloned().collect();
        loading.sort();

        ModelCacheStatus {
            running: state.running,
            uptime_secs: state
                .started_at
                .map(|t| now.duration_since(t).as_secs_f64())
                .unwrap_or(0.0),
            cache_size: self.settings.cache_size,
            model_timeout_secs: self.settings.model_timeout.as_secs(),
            models,
            loading,
            total_memory_estimate_mb,
        }
    }
}

impl Drop for ModelCacheManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_state(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pop least recently used entries until there is room for one more
fn make_room(state: &mut CacheState, cache_size: usize) -> Vec<(String, CachedModel)> {
    let mut evicted = Vec::new();
    while state.models.len() >= cache_size {
        match state.models.pop_lru() {
            Some(entry) => evicted.push(entry),
            None => break,
        }
    }
    evicted
}

fn expire_idle(state: &Mutex<CacheState>, timeout: Duration) -> Vec<String> {
    let now = Instant::now();
    let expired: Vec<(String, CachedModel)> = {
        let mut state = lock_state(state);
        let names: Vec<String> = state
            .models
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) > timeout)
            .map(|(name, _)| name.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| state.models.pop(&name).map(|entry| (name, entry)))
            .collect()
    };

    let names: Vec<String> = expired.iter().map(|(name, _)| name.clone()).collect();
    for name in &names {
        tracing::info!(
            "Unloading idle model '{}' (unused for more than {}s)",
            name,
            timeout.as_secs()
        );
    }
    release_all(expired, "idle");
    names
}

fn release_all(entries: Vec<(String, CachedModel)>, reason: &str) {
    for (name, entry) in entries {
        tracing::debug!("Releasing model '{}' ({})", name, reason);
        let recognizer = entry.recognizer;
        if catch_unwind(AssertUnwindSafe(|| recognizer.release())).is_err() {
            tracing::warn!("Panic while releasing model '{}'", name);
        }
    }
}

fn spawn_sweeper(
    state: Weak<Mutex<CacheState>>,
    interval: Duration,
    timeout: Duration,
) -> std::io::Result<Sweeper> {
    let (cancel, cancelled) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("stt-model-sweep".to_string())
        .spawn(move || loop {
            match cancelled.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(state) = state.upgrade() else {
                        break;
                    };
                    expire_idle(&state, timeout);
                }
                _ => break,
            }
        })?;
    Ok(Sweeper { cancel, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TranscribeError;
    use crate::transcribe::ListenOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRecognizer {
        model: String,
    }

    impl SpeechRecognizer for FakeRecognizer {
        fn listen(
            &self,
            _options: &ListenOptions,
            _on_interim: &mut dyn FnMut(&str),
        ) -> Result<String, TranscribeError> {
            Ok(format!("heard by {}", self.model))
        }

        fn model_name(&self) -> &str {
            &self.model
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        loads: AtomicUsize,
        delay: Duration,
    }

    impl RecognizerFactory for FakeFactory {
        fn create(
            &self,
            model: &str,
            _device: &DeviceSpec,
        ) -> Result<Arc<dyn SpeechRecognizer>, TranscribeError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            match model {
                "broken" => Err(TranscribeError::ModelNotFound(model.to_string())),
                "explosive" => panic!("bad weights"),
                _ => Ok(Arc::new(FakeRecognizer {
                    model: model.to_string(),
                })),
            }
        }

        fn device_for(&self, _model: &str) -> DeviceSpec {
            DeviceSpec::cpu()
        }
    }

    fn settings(cache_size: usize) -> ModelCacheSettings {
        ModelCacheSettings {
            cache_size,
            model_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            load_wait_timeout: Duration::from_secs(5),
            preload_models: vec![],
        }
    }

    fn started(settings: ModelCacheSettings) -> (ModelCacheManager, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let manager = ModelCacheManager::new(settings, factory.clone());
        manager.start();
        (manager, factory)
    }

    #[test]
    fn test_not_running() {
        let manager = ModelCacheManager::new(settings(2), Arc::new(FakeFactory::default()));
        assert_eq!(manager.preload_model("base"), Err(ModelError::NotRunning));
        assert!(manager.get_model_recorder("base").is_none());
    }

    #[test]
    fn test_launch_accepts_requests_before_preload() {
        let factory = Arc::new(FakeFactory::default());
        let manager = ModelCacheManager::new(
            ModelCacheSettings {
                preload_models: vec!["base".to_string()],
                ..settings(2)
            },
            factory.clone(),
        );

        assert!(manager.launch());
        assert!(!manager.launch());
        assert!(manager.is_running());
        assert!(manager.get_model_recorder("base").is_some());

        let report = manager.preload_configured();
        assert_eq!(report.preloaded, vec!["base".to_string()]);
        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);
        assert!(manager.start().preloaded.is_empty());
        manager.stop();
    }

    #[test]
    fn test_preload_then_cached() {
        let (manager, factory) = started(settings(2));

        let first = manager.preload_model("base").unwrap();
        assert!(!first.cached);
        assert!(first.load_time.is_some());

        let second = manager.preload_model("base").unwrap();
        assert!(second.cached);
        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lru_eviction_respects_access() {
        let (manager, _) = started(settings(2));
        manager.preload_model("tiny").unwrap();
        manager.preload_model("base").unwrap();

        // Touch tiny so base becomes least recently used
        assert!(manager.get_model_recorder("tiny").is_some());
        manager.preload_model("small").unwrap();

        assert_eq!(manager.loaded_model_names(), vec!["tiny", "small"]);
    }

    #[test]
    fn test_eviction_by_insertion_order() {
        let (manager, _) = started(settings(2));
        manager.preload_model("tiny").unwrap();
        manager.preload_model("base").unwrap();
        manager.preload_model("small").unwrap();
        assert_eq!(manager.loaded_model_names(), vec!["base", "small"]);
    }

    #[test]
    fn test_load_failure_clears_in_flight() {
        let (manager, factory) = started(settings(2));

        assert!(matches!(
            manager.preload_model("broken"),
            Err(ModelError::LoadFailed(_, _))
        ));
        assert!(matches!(
            manager.preload_model("explosive"),
            Err(ModelError::LoadFailed(_, _))
        ));
        assert!(manager.get_status().loading.is_empty());

        // A retry is a fresh load, not a wait on a dead marker
        assert!(manager.preload_model("broken").is_err());
        assert_eq!(factory.loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unload_model() {
        let (manager, _) = started(settings(2));
        manager.preload_model("base").unwrap();
        assert!(manager.unload_model("base"));
        assert!(!manager.is_loaded("base"));
        assert!(manager.unload_model("never-loaded"));
    }

    #[test]
    fn test_expiry_is_strict() {
        let mut s = settings(2);
        s.model_timeout = Duration::from_millis(300);
        let (manager, _) = started(s);
        manager.preload_model("base").unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(manager.cleanup_expired_models().is_empty());
        assert!(manager.is_loaded("base"));

        thread::sleep(Duration::from_millis(300));
        assert_eq!(manager.cleanup_expired_models(), vec!["base"]);
        assert!(!manager.is_loaded("base"));
    }

    #[test]
    fn test_start_preloads_best_effort() {
        let mut s = settings(3);
        s.preload_models = vec!["base".into(), "broken".into(), "tiny".into()];
        let factory = Arc::new(FakeFactory::default());
        let manager = ModelCacheManager::new(s, factory);

        let report = manager.start();
        assert_eq!(report.preloaded, vec!["base", "tiny"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");

        // Second start is a no-op
        assert!(manager.start().preloaded.is_empty());
    }

    #[test]
    fn test_stop_unloads_everything() {
        let (manager, _) = started(settings(2));
        manager.preload_model("base").unwrap();
        manager.stop();
        manager.stop();
        assert!(!manager.is_running());
        assert!(manager.loaded_model_names().is_empty());
        assert_eq!(manager.preload_model("base"), Err(ModelError::NotRunning));
    }

    #[test]
    fn test_status_report() {
        let (manager, _) = started(settings(2));
        manager.preload_model("tiny").unwrap();
        manager.preload_model("base").unwrap();

        let status = manager.get_status();
        assert!(status.running);
        assert_eq!(status.cache_size, 2);
        assert_eq!(status.models[0].name, "base");
        assert_eq!(status.models[0].device, "cpu");
        assert_eq!(status.total_memory_estimate_mb, 39 + 74);
    }

    #[test]
    fn test_zero_cache_size_clamped() {
        let (manager, _) = started(settings(0));
        manager.preload_model("base").unwrap();
        assert_eq!(manager.settings().cache_size, 1);
        assert!(manager.is_loaded("base"));
    }
}
