use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use deskstream_capture::{CaptureBackend, CaptureEngine, CaptureState, SyntheticControl, SyntheticSource};
use deskstream_core::{BackendKind, CaptureError, CaptureSettings, SyntheticSettings};

fn settings(fps: u32, queue_capacity: usize) -> CaptureSettings {
    CaptureSettings {
        backend: BackendKind::Synthetic,
        target_fps: fps,
        queue_capacity,
        error_backoff_ms: 10,
        synthetic: SyntheticSettings { width: 64, height: 32, fps, monitors: 2 },
        ..Default::default()
    }
}

fn engine(settings: CaptureSettings) -> (CaptureEngine, Arc<SyntheticControl>) {
    let source = SyntheticSource::new(settings.synthetic.clone());
    let control = source.control();
    (CaptureEngine::with_backend(settings, CaptureBackend::Synthetic(source)), control)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn start_requires_initialize() {
    let (mut engine, _) = engine(settings(60, 3));
    assert_eq!(engine.state(), CaptureState::Uninitialized);
    assert_eq!(engine.start_capture(), Err(CaptureError::NotInitialized));

    engine.initialize().unwrap();
    assert_eq!(engine.state(), CaptureState::Initialized);
    assert!(engine.is_initialized());
}

#[test]
fn frames_arrive_in_capture_order() {
    let (mut engine, _) = engine(settings(200, 8));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.is_capturing());

    let mut last = 0u64;
    for _ in 0..20 {
        let frame = engine.get_next_frame(1_000).expect("synthetic frame");
        assert!(frame.timestamp_us() > last, "frame {} after {}", frame.timestamp_us(), last);
        assert_eq!((frame.width(), frame.height()), (64, 32));
        assert_eq!(frame.data().len(), frame.stride() as usize * 32);
        last = frame.timestamp_us();
    }

    engine.stop_capture();
    assert_eq!(engine.state(), CaptureState::Stopped);
    assert!(engine.get_stats().frames_captured >= 20);
}

#[test]
fn drops_exactly_the_overflow_when_consumer_stalls() {
    let capacity = 2;
    let (mut engine, _) = engine(settings(500, capacity));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();

    assert!(wait_until(Duration::from_secs(5), || engine.get_stats().frames_captured >= 20));
    assert!(engine.queued() <= capacity);
    engine.stop_capture();

    let stats = engine.get_stats();
    assert_eq!(stats.frames_dropped, stats.frames_captured - capacity as u64);
    assert_eq!(engine.queued(), 0);
}

#[test]
fn stop_and_shutdown_are_idempotent() {
    let (mut engine, _) = engine(settings(60, 3));
    engine.stop_capture();
    engine.shutdown();

    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    engine.start_capture().unwrap();
    engine.stop_capture();
    engine.stop_capture();
    assert_eq!(engine.state(), CaptureState::Stopped);

    // Stopped is re-enterable
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());

    engine.shutdown();
    engine.shutdown();
    assert_eq!(engine.state(), CaptureState::Uninitialized);
    assert!(!engine.is_initialized());
}

#[test]
fn pop_honours_timeout_and_returns_immediately_when_stopped() {
    let (mut engine, _) = engine(settings(1, 3));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();

    // First frame is due immediately, the next one a second later
    assert!(engine.get_next_frame(2_000).is_some());
    let start = Instant::now();
    assert!(engine.get_next_frame(100).is_none());
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(100), "returned after {waited:?}");

    engine.stop_capture();
    let start = Instant::now();
    assert!(engine.get_next_frame(5_000).is_none());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn reinitializes_after_access_lost() {
    let (mut engine, control) = engine(settings(200, 4));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());
    assert_eq!(control.initializations(), 1);

    control.lose_access();
    assert!(wait_until(Duration::from_secs(5), || control.initializations() == 2));

    // Drain anything captured before the loss, then expect fresh frames
    while engine.get_next_frame(0).is_some() {}
    assert!(engine.get_next_frame(1_000).is_some());
    assert!(engine.is_initialized());
    assert!(engine.is_capturing());
}

#[test]
fn stays_uninitialized_after_access_lost_without_reinit() {
    let mut s = settings(200, 4);
    s.reinitialize_on_access_lost = false;
    let (mut engine, control) = engine(s);
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());

    control.lose_access();
    assert!(wait_until(Duration::from_secs(5), || !engine.is_initialized()));
    engine.stop_capture();
    assert_eq!(control.initializations(), 1);

    assert_eq!(engine.start_capture(), Err(CaptureError::NotInitialized));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());
}

#[test]
fn initialize_during_capture_rebinds_after_access_lost() {
    let mut s = settings(200, 4);
    s.reinitialize_on_access_lost = false;
    let (mut engine, control) = engine(s);
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());

    control.lose_access();
    assert!(wait_until(Duration::from_secs(5), || !engine.is_initialized()));
    while engine.get_next_frame(0).is_some() {}

    engine.initialize().unwrap();
    assert_eq!(control.initializations(), 2);
    assert!(engine.is_initialized());
    assert_eq!(engine.state(), CaptureState::Capturing);
    assert!(engine.get_next_frame(1_000).is_some());
}

#[test]
fn failed_rebind_during_capture_is_reported() {
    let mut s = settings(200, 4);
    s.reinitialize_on_access_lost = false;
    let (mut engine, control) = engine(s);
    engine.initialize().unwrap();
    engine.start_capture().unwrap();

    control.deny_initialize(true);
    control.lose_access();
    assert!(wait_until(Duration::from_secs(5), || !engine.is_initialized()));

    assert!(matches!(engine.initialize(), Err(CaptureError::AccessDenied { .. })));
    assert_eq!(engine.state(), CaptureState::Uninitialized);
    assert!(!engine.is_capturing());
    assert!(engine.get_next_frame(50).is_none());

    control.deny_initialize(false);
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());
}

#[test]
fn initialize_while_capturing_a_bound_backend_is_a_no_op() {
    let (mut engine, control) = engine(settings(200, 4));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());

    engine.initialize().unwrap();
    assert_eq!(control.initializations(), 1);
    assert!(engine.is_capturing());
    assert!(engine.get_next_frame(1_000).is_some());
}

#[test]
fn capture_thread_survives_panics_and_errors() {
    let (mut engine, control) = engine(settings(200, 4));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());

    control.panic_next();
    control.fail_next("transient device hiccup");
    let before = engine.get_stats().frames_captured;
    assert!(wait_until(Duration::from_secs(5), || engine.get_stats().frames_captured > before + 10));
    assert!(engine.is_capturing());

    // Every mapping handed out was released, including the unwound one
    engine.stop_capture();
    assert_eq!(control.mappings_acquired(), control.mappings_released());
}

#[test]
fn set_monitor_is_rejected_while_capturing() {
    let (mut engine, control) = engine(settings(60, 3));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert_eq!(engine.set_monitor(1), Err(CaptureError::Busy));

    engine.stop_capture();
    engine.set_monitor(1).unwrap();
    assert_eq!(engine.settings().monitor_index, 1);
    assert_eq!(engine.state(), CaptureState::Initialized);
    assert_eq!(control.initializations(), 2);

    assert!(matches!(
        engine.set_monitor(5),
        Err(CaptureError::OutputNotFound { index: 5, available: 2 })
    ));
    assert_eq!(engine.state(), CaptureState::Uninitialized);
}

#[test]
fn denied_initialize_surfaces_access_denied() {
    let (mut engine, control) = engine(settings(60, 3));
    control.deny_initialize(true);
    assert!(matches!(engine.initialize(), Err(CaptureError::AccessDenied { .. })));
    assert_eq!(engine.state(), CaptureState::Uninitialized);

    control.deny_initialize(false);
    engine.initialize().unwrap();
    assert_eq!(engine.available_monitors().len(), 2);
}

#[test]
fn drop_while_capturing_joins_the_thread() {
    let (mut engine, control) = engine(settings(200, 3));
    engine.initialize().unwrap();
    engine.start_capture().unwrap();
    assert!(engine.get_next_frame(1_000).is_some());
    drop(engine);
    assert_eq!(control.mappings_acquired(), control.mappings_released());
}
