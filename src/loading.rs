//! Background component loading
//!
//! Startup must not block on speech engines or the keyboard listener, so
//! each component is initialized by a loader running on a small named
//! worker pool. Consumers check the component's status and, if it is still
//! loading, wait a bounded time before building it themselves.
//!
//! Status transitions:
//!
//! ```text
//! NotStarted -> Loading -> Ready
//!                       -> Failed
//! ```
//!
//! Ready and Failed are terminal until [`ComponentLoadingCoordinator::shutdown`]
//! resets every component to NotStarted.

use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Number of preload workers, one per component type
pub const WORKER_COUNT: usize = 3;

/// Status polling interval for [`ComponentLoadingCoordinator::wait_for_ready`]
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long consumers wait for an in-flight load before building on demand
pub const CONSUMER_WAIT: Duration = Duration::from_secs(2);

/// How long shutdown waits for running loaders
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    NotStarted,
    Loading,
    Ready,
    Failed,
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentStatus::NotStarted => write!(f, "not_started"),
            ComponentStatus::Loading => write!(f, "loading"),
            ComponentStatus::Ready => write!(f, "ready"),
            ComponentStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Tts,
    Stt,
    Hotkey,
}

impl ComponentType {
    pub const ALL: [ComponentType; 3] = [ComponentType::Tts, ComponentType::Stt, ComponentType::Hotkey];
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentType::Tts => write!(f, "tts"),
            ComponentType::Stt => write!(f, "stt"),
            ComponentType::Hotkey => write!(f, "hotkey"),
        }
    }
}

/// Initializes one component. `Ok(false)` is a clean failure.
pub type Loader = Box<dyn FnOnce() -> anyhow::Result<bool> + Send + 'static>;

/// Status and failure message of one component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentSnapshot {
    pub component: ComponentType,
    pub status: ComponentStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct ComponentRecord {
    status: ComponentStatus,
    error: Option<String>,
}

impl Default for ComponentRecord {
    fn default() -> Self {
        Self {
            status: ComponentStatus::NotStarted,
            error: None,
        }
    }
}

struct CoordinatorState {
    components: HashMap<ComponentType, ComponentRecord>,
    started: bool,
    /// Bumped on shutdown so loads finishing afterwards are discarded
    generation: u64,
}

impl CoordinatorState {
    fn new() -> Self {
        Self {
            components: ComponentType::ALL
                .iter()
                .map(|c| (*c, ComponentRecord::default()))
                .collect(),
            started: false,
            generation: 0,
        }
    }
}

const JOB_PENDING: u8 = 0;
const JOB_RUNNING: u8 = 1;
const JOB_CANCELLED: u8 = 2;

struct Job {
    component: ComponentType,
    generation: u64,
    ticket: Arc<AtomicU8>,
    loader: Loader,
}

struct WorkerPool {
    sender: Sender<Job>,
    tickets: Vec<(ComponentType, Arc<AtomicU8>)>,
    workers: Vec<JoinHandle<()>>,
    exited: Receiver<()>,
}

/// Drives background initialization of the TTS, STT and hotkey components
pub struct ComponentLoadingCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    pool: Mutex<Option<WorkerPool>>,
}

impl Default for ComponentLoadingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentLoadingCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::new())),
            pool: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        lock_state(&self.state)
    }

    /// Start loading the given components in the background
    ///
    /// Only the first call after construction (or after shutdown) does
    /// anything; later calls return false.
    pub fn start_background_loading(&self, loaders: Vec<(ComponentType, Loader)>) -> bool {
        let mut pool_slot = self.pool.lock().unwrap_or_else(|p| p.into_inner());

        let generation = {
            let mut state = self.state();
            if state.started {
                tracing::debug!("Background loading already started");
                return false;
            }
            state.started = true;
            for (component, _) in &loaders {
                if let Some(record) = state.components.get_mut(component) {
                    record.status = ComponentStatus::Loading;
                    record.error = None;
                }
            }
            state.generation
        };

        if loaders.is_empty() {
            tracing::debug!("No components enabled for background loading");
            return true;
        }

        let mut pool = match self.spawn_pool() {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!("Failed to start preload workers: {}", e);
                let mut state = self.state();
                for (component, _) in &loaders {
                    if let Some(record) = state.components.get_mut(component) {
                        record.status = ComponentStatus::Failed;
                        record.error = Some(format!("Error during {} preloading: {}", component, e));
                    }
                }
                return true;
            }
        };

        for (component, loader) in loaders {
            tracing::info!("Starting background loading for {}", component);
            let ticket = Arc::new(AtomicU8::new(JOB_PENDING));
            pool.tickets.push((component, Arc::clone(&ticket)));
            let job = Job {
                component,
                generation,
                ticket,
                loader,
            };
            if pool.sender.send(job).is_err() {
                record_result(
                    &self.state,
                    component,
                    generation,
                    ComponentStatus::Failed,
                    Some(format!("Error during {} preloading: worker pool closed", component)),
                );
            }
        }

        *pool_slot = Some(pool);
        true
    }

    fn spawn_pool(&self) -> std::io::Result<WorkerPool> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let (exit_tx, exited) = mpsc::channel::<()>();
        let mut workers = Vec::with_capacity(WORKER_COUNT);

        for i in 0..WORKER_COUNT {
            let receiver = Arc::clone(&receiver);
            let state = Arc::clone(&self.state);
            let exit_tx = exit_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("voice-preload-{}", i))
                .spawn(move || {
                    loop {
                        let job = {
                            let rx = receiver.lock().unwrap_or_else(|p| p.into_inner());
                            rx.recv()
                        };
                        match job {
                            Ok(job) => run_job(&state, job),
                            Err(_) => break,
                        }
                    }
                    let _ = exit_tx.send(());
                })?;
            workers.push(handle);
        }

        Ok(WorkerPool {
            sender,
            tickets: Vec::new(),
            workers,
            exited,
        })
    }

    pub fn get_status(&self, component: ComponentType) -> ComponentStatus {
        self.state()
            .components
            .get(&component)
            .map(|r| r.status)
            .unwrap_or(ComponentStatus::NotStarted)
    }

    /// Failure message recorded for a component
    pub fn get_error(&self, component: ComponentType) -> Option<String> {
        self.state()
            .components
            .get(&component)
            .and_then(|r| r.error.clone())
    }

    pub fn is_ready(&self, component: ComponentType) -> bool {
        self.get_status(component) == ComponentStatus::Ready
    }

    pub fn is_loading(&self, component: ComponentType) -> bool {
        self.get_status(component) == ComponentStatus::Loading
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Snapshot of every component
    pub fn overall_status(&self) -> Vec<ComponentSnapshot> {
        let state = self.state();
        ComponentType::ALL
            .iter()
            .map(|c| {
                let record = state.components.get(c).cloned().unwrap_or_default();
                ComponentSnapshot {
                    component: *c,
                    status: record.status,
                    error: record.error,
                }
            })
            .collect()
    }

    /// Poll until the component is ready, has failed, or `timeout` passes
    pub fn wait_for_ready(&self, component: ComponentType, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.get_status(component) {
                ComponentStatus::Ready => return true,
                ComponentStatus::Failed => return false,
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Wait up to `timeout` if the component is still loading, then
    /// report where it ended up
    pub fn settle(&self, component: ComponentType, timeout: Duration) -> ComponentStatus {
        if self.is_loading(component) {
            tracing::debug!("Waiting up to {:?} for {} to finish loading", timeout, component);
            self.wait_for_ready(component, timeout);
        }
        self.get_status(component)
    }

    /// Cancel queued loads, wait for running ones, and reset all statuses
    ///
    /// Safe to call repeatedly.
    pub fn shutdown(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        if let Some(pool) = pool {
            let WorkerPool {
                sender,
                tickets,
                workers,
                exited,
            } = pool;

            for (component, ticket) in &tickets {
                if ticket
                    .compare_exchange(JOB_PENDING, JOB_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::debug!("Cancelled pending {} load", component);
                }
            }
            drop(sender);

            let deadline = Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
            let mut remaining = workers.len();
            while remaining > 0 {
                let wait = deadline.saturating_duration_since(Instant::now());
                if exited.recv_timeout(wait).is_err() {
                    break;
                }
                remaining -= 1;
            }
            if remaining > 0 {
                tracing::warn!(
                    "{} preload worker(s) still running after {:?}, detaching",
                    remaining,
                    SHUTDOWN_JOIN_TIMEOUT
                );
            }
            for worker in workers {
                if worker.is_finished() {
                    let _ = worker.join();
                }
            }
        }

        let mut state = self.state();
        if state.started {
            tracing::debug!("Component loading coordinator shut down");
        }
        state.generation += 1;
        state.started = false;
        for record in state.components.values_mut() {
            *record = ComponentRecord::default();
        }
    }
}

impl Drop for ComponentLoadingCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_state(state: &Mutex<CoordinatorState>) -> MutexGuard<'_, CoordinatorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record_result(
    state: &Mutex<CoordinatorState>,
    component: ComponentType,
    generation: u64,
    status: ComponentStatus,
    error: Option<String>,
) {
    let mut state = lock_state(state);
    if state.generation != generation {
        tracing::debug!("Discarding {} load result after shutdown", component);
        return;
    }
    if let Some(record) = state.components.get_mut(&component) {
        if record.status != ComponentStatus::Loading {
            return;
        }
        record.status = status;
        record.error = error;
    }
}

fn run_job(state: &Mutex<CoordinatorState>, job: Job) {
    let Job {
        component,
        generation,
        ticket,
        loader,
    } = job;

    if ticket
        .compare_exchange(JOB_PENDING, JOB_RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let started = Instant::now();
    let (status, error) = match catch_unwind(AssertUnwindSafe(loader)) {
        Ok(Ok(true)) => {
            tracing::info!("{} loaded in {:.2?}", component, started.elapsed());
            (ComponentStatus::Ready, None)
        }
        Ok(Ok(false)) => {
            let message = format!("{} preloading failed", component);
            tracing::error!("{}", message);
            (ComponentStatus::Failed, Some(message))
        }
        Ok(Err(e)) => {
            let message = format!("Error during {} preloading: {:#}", component, e);
            tracing::error!("{}", message);
            (ComponentStatus::Failed, Some(message))
        }
        Err(panic) => {
            let message = format!(
                "Error during {} preloading: {}",
                component,
                panic_message(panic.as_ref())
            );
            tracing::error!("{}", message);
            (ComponentStatus::Failed, Some(message))
        }
    };

    record_result(state, component, generation, status, error);
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
