//! Capture engine: owns one backend, a dedicated capture thread and the
//! frame queue the orchestrator pulls from.
//!
//! ```text
//!   Uninitialized ──initialize──► Initialized ──start_capture──► Capturing
//!                                      ▲                            │
//!                                      │ set_monitor          stop_capture
//!                                      │                            ▼
//!                                      └────────────────────────  Stopped ──start_capture──► Capturing
//! ```
//!
//! While capturing, the backend lives on the capture thread and comes back
//! through the thread's `JoinHandle` on stop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use deskstream_core::{CaptureError, CaptureSettings, CaptureStats, Frame, MonitorInfo, Resolution};
use tracing::{debug, error, info, warn, Span};

use crate::backend::CaptureBackend;
use crate::queue::FrameQueue;
use crate::stats::CaptureStatsTracker;

// MARK: - State

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Uninitialized,
    Initialized,
    Capturing,
    Stopped,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Capturing => "capturing",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Run flag whose waits wake as soon as `stop` is called.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn reset(&self) {
        *self.lock() = false;
    }

    fn stop(&self) {
        *self.lock() = true;
        self.cv.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.lock()
    }

    /// Sleep for `dur` unless stopped first. Returns `true` when stopped.
    fn wait(&self, dur: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, dur, |stopped| !*stopped)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// State shared between the engine handle and its capture thread.
struct Shared {
    queue: FrameQueue,
    stats: CaptureStatsTracker,
    signal: StopSignal,
    backend_ready: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct LoopParams {
    monitor: usize,
    poll_timeout_ms: u32,
    backoff: Duration,
    reinitialize: bool,
}

// MARK: - CaptureEngine

pub struct CaptureEngine {
    settings: CaptureSettings,
    state: CaptureState,
    backend: Option<CaptureBackend>,
    worker: Option<JoinHandle<CaptureBackend>>,
    shared: Arc<Shared>,
    monitors: Vec<MonitorInfo>,
    span: Span,
}

impl CaptureEngine {
    /// Build an engine around the backend named in `settings`.
    pub fn new(settings: CaptureSettings) -> Result<Self, CaptureError> {
        let backend = CaptureBackend::create(&settings)?;
        Ok(Self::with_backend(settings, backend))
    }

    pub fn with_backend(settings: CaptureSettings, backend: CaptureBackend) -> Self {
        let span = tracing::info_span!("capture", monitor = settings.monitor_index);
        let shared = Arc::new(Shared {
            queue: FrameQueue::new(settings.queue_capacity.max(1)),
            stats: CaptureStatsTracker::new(),
            signal: StopSignal::default(),
            backend_ready: AtomicBool::new(false),
        });
        // Nothing to pop until capture starts
        shared.queue.close();
        let monitors = backend.monitors();
        Self {
            settings,
            state: CaptureState::Uninitialized,
            backend: Some(backend),
            worker: None,
            shared,
            monitors,
            span,
        }
    }

    /// Replace the default `capture{monitor}` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map_or("capturing", |b| b.name())
    }

    /// Bind the backend to the configured monitor and reset stats.
    ///
    /// While capturing this is a no-op as long as the backend is bound. When
    /// the capture thread has lost its binding, the thread is stopped, the
    /// backend rebound and capture restarted; the result is that of the rebind.
    pub fn initialize(&mut self) -> Result<(), CaptureError> {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.state == CaptureState::Capturing {
            if self.shared.backend_ready.load(Ordering::SeqCst) {
                return Ok(());
            }
            info!("Rebinding capture backend after losing it");
            self.stop_capture();
            self.bind_backend()?;
            return self.start_capture();
        }
        self.bind_backend()
    }

    fn bind_backend(&mut self) -> Result<(), CaptureError> {
        let monitor = self.settings.monitor_index;
        let backend = self.home_backend()?;
        let result = backend.initialize(monitor);
        let native = backend.native_resolution();
        let monitors = backend.monitors();

        self.monitors = monitors;
        self.shared.stats.reset(Instant::now());
        match result {
            Ok(()) => {
                self.state = CaptureState::Initialized;
                self.shared.backend_ready.store(true, Ordering::SeqCst);
                info!(
                    "Capture initialized on monitor {} ({})",
                    monitor,
                    native.map_or_else(|| "size pending".to_string(), |r| r.to_string())
                );
                Ok(())
            }
            Err(e) => {
                self.state = CaptureState::Uninitialized;
                self.shared.backend_ready.store(false, Ordering::SeqCst);
                warn!("Capture initialization failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        let span = self.span.clone();
        let _enter = span.enter();
        match self.state {
            CaptureState::Capturing => return Ok(()),
            CaptureState::Uninitialized => return Err(CaptureError::NotInitialized),
            CaptureState::Initialized | CaptureState::Stopped => {}
        }
        if !self.home_backend()?.is_initialized() {
            self.state = CaptureState::Uninitialized;
            return Err(CaptureError::NotInitialized);
        }
        let Some(backend) = self.backend.take() else {
            return Err(CaptureError::NotInitialized);
        };

        let shared = &self.shared;
        shared.queue.clear();
        shared.queue.open();
        shared.stats.reset(Instant::now());
        shared.signal.reset();
        shared.backend_ready.store(true, Ordering::SeqCst);

        let params = LoopParams {
            monitor: self.settings.monitor_index,
            poll_timeout_ms: self.settings.poll_timeout_ms(),
            backoff: self.settings.error_backoff(),
            reinitialize: self.settings.reinitialize_on_access_lost,
        };
        let thread_shared = Arc::clone(shared);
        let thread_span = self.span.clone();
        let spawned = thread::Builder::new()
            .name(format!("deskstream-capture-{}", params.monitor))
            .spawn(move || capture_loop(backend, thread_shared, params, thread_span));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.state = CaptureState::Capturing;
                info!(
                    "Capture started (target {} fps, queue capacity {})",
                    self.settings.target_fps,
                    shared.queue.capacity()
                );
                Ok(())
            }
            Err(e) => {
                // The backend went down with the closure
                shared.queue.close();
                self.backend = CaptureBackend::create(&self.settings).ok();
                self.state = CaptureState::Uninitialized;
                error!("Failed to spawn capture thread: {}", e);
                Err(CaptureError::Failed { reason: format!("spawn capture thread: {e}") })
            }
        }
    }

    /// Stop the capture thread and drain the queue. No-op unless capturing.
    pub fn stop_capture(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.state != CaptureState::Capturing {
            return;
        }
        self.shared.signal.stop();
        self.shared.queue.close();

        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(backend) => {
                    self.shared
                        .backend_ready
                        .store(backend.is_initialized(), Ordering::SeqCst);
                    self.backend = Some(backend);
                }
                Err(_) => {
                    error!("Capture thread panicked outside its loop; recreating backend");
                    self.shared.backend_ready.store(false, Ordering::SeqCst);
                    self.backend = CaptureBackend::create(&self.settings).ok();
                }
            }
        }

        let stale = self.shared.queue.clear();
        self.state = CaptureState::Stopped;
        let stats = self.shared.stats.snapshot();
        info!(
            "Capture stopped: {} frames captured, {} dropped, {} discarded on stop",
            stats.frames_captured, stats.frames_dropped, stale
        );
    }

    /// Oldest queued frame, waiting up to `timeout_ms`.
    pub fn get_next_frame(&self, timeout_ms: u32) -> Option<Frame> {
        self.shared.queue.pop(Duration::from_millis(timeout_ms as u64))
    }

    pub fn get_stats(&self) -> CaptureStats {
        self.shared.stats.snapshot()
    }

    /// Change the capture target. Rejected with `Busy` while capturing.
    pub fn set_monitor(&mut self, index: usize) -> Result<(), CaptureError> {
        if self.state == CaptureState::Capturing {
            return Err(CaptureError::Busy);
        }
        let was_initialized = self.is_initialized();
        self.settings.monitor_index = index;
        self.span = tracing::info_span!("capture", monitor = index);
        if was_initialized {
            if let Some(backend) = self.backend.as_mut() {
                backend.shutdown();
            }
            return self.initialize();
        }
        Ok(())
    }

    /// Monitors reported by the backend at the last initialize (or at
    /// construction).
    pub fn available_monitors(&self) -> Vec<MonitorInfo> {
        match &self.backend {
            Some(backend) => backend.monitors(),
            None => self.monitors.clone(),
        }
    }

    /// Size of the bound output. `None` while capturing or before the
    /// backend has seen a frame.
    pub fn native_resolution(&self) -> Option<Resolution> {
        self.backend.as_ref()?.native_resolution()
    }

    pub fn is_capturing(&self) -> bool {
        self.state == CaptureState::Capturing
    }

    pub fn is_initialized(&self) -> bool {
        match &self.backend {
            Some(backend) => backend.is_initialized(),
            None => self.shared.backend_ready.load(Ordering::SeqCst),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Frames currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop capturing and release the backend. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.stop_capture();
        if let Some(backend) = self.backend.as_mut() {
            if backend.is_initialized() {
                let _enter = self.span.enter();
                backend.shutdown();
                debug!("Capture backend shut down");
            }
        }
        self.shared.backend_ready.store(false, Ordering::SeqCst);
        self.state = CaptureState::Uninitialized;
    }

    fn home_backend(&mut self) -> Result<&mut CaptureBackend, CaptureError> {
        if self.backend.is_none() {
            self.backend = Some(CaptureBackend::create(&self.settings)?);
        }
        self.backend.as_mut().ok_or(CaptureError::NotInitialized)
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("state", &self.state)
            .field("monitor", &self.settings.monitor_index)
            .field("queued", &self.shared.queue.len())
            .finish_non_exhaustive()
    }
}

// MARK: - Capture thread

fn capture_loop(
    mut backend: CaptureBackend,
    shared: Arc<Shared>,
    params: LoopParams,
    span: Span,
) -> CaptureBackend {
    let _enter = span.enter();
    debug!("Capture thread running ({} ms poll)", params.poll_timeout_ms);

    while !shared.signal.is_stopped() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            capture_once(&mut backend, &shared, params.poll_timeout_ms)
        }));

        match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(CaptureError::AccessLost)) => {
                warn!("Capture access lost on monitor {}", params.monitor);
                shared.backend_ready.store(false, Ordering::SeqCst);
            }
            Ok(Err(CaptureError::NotInitialized)) => {
                debug!("Capture backend not initialized");
                shared.backend_ready.store(false, Ordering::SeqCst);
            }
            Ok(Err(e)) => warn!("Capture error: {}", e),
            Err(payload) => error!("Capture iteration panicked: {}", panic_message(&*payload)),
        }

        if shared.signal.wait(params.backoff) {
            break;
        }
        if params.reinitialize && !backend.is_initialized() {
            match backend.initialize(params.monitor) {
                Ok(()) => {
                    shared.backend_ready.store(true, Ordering::SeqCst);
                    info!("Capture reinitialized on monitor {}", params.monitor);
                }
                Err(e) => warn!("Capture reinitialization failed: {}", e),
            }
        }
    }

    debug!("Capture thread exiting");
    backend
}

/// One poll: capture, copy out, release the mapping, queue.
fn capture_once(
    backend: &mut CaptureBackend,
    shared: &Shared,
    timeout_ms: u32,
) -> Result<(), CaptureError> {
    let Some(mapped) = backend.capture_frame(timeout_ms)? else {
        return Ok(());
    };
    let frame = mapped.to_frame();
    drop(mapped);
    let frame = frame?;

    let bytes = frame.data().len() as u64;
    let evicted = shared.queue.push(frame).is_some();
    shared.stats.record_frame(Instant::now(), bytes, evicted);
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
