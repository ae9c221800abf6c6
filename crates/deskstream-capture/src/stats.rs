use std::sync::Mutex;
use std::time::Instant;

use deskstream_core::rate::RollingRate;
use deskstream_core::CaptureStats;

struct Inner {
    started: Option<Instant>,
    stats: CaptureStats,
    window: RollingRate,
}

/// Capture counters behind a single lock.
///
/// Each update touches counters and derived rates in one critical section so
/// readers never observe a half-applied frame.
pub struct CaptureStatsTracker {
    inner: Mutex<Inner>,
}

impl Default for CaptureStatsTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                started: None,
                stats: CaptureStats::default(),
                window: RollingRate::default(),
            }),
        }
    }
}

impl CaptureStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter and restart the wall-clock average at `now`.
    pub fn reset(&self, now: Instant) {
        let mut inner = self.lock();
        inner.started = Some(now);
        inner.stats = CaptureStats::default();
        inner.window.clear();
    }

    /// Count one captured frame and, when queueing it evicted an older one,
    /// that drop as well.
    pub fn record_frame(&self, now: Instant, bytes: u64, evicted: bool) {
        let mut inner = self.lock();
        let started = *inner.started.get_or_insert(now);
        inner.stats.frames_captured += 1;
        inner.stats.bytes_captured += bytes;
        if evicted {
            inner.stats.frames_dropped += 1;
        }
        inner.window.record(now, bytes);
        inner.stats.current_fps = inner.window.events_per_sec(now);
        let elapsed = now.duration_since(started).as_secs_f32();
        if elapsed > 0.0 {
            inner.stats.average_fps = inner.stats.frames_captured as f32 / elapsed;
        }
    }

    pub fn snapshot(&self) -> CaptureStats {
        self.lock().stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
