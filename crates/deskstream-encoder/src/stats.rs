use std::sync::Mutex;
use std::time::Instant;

use deskstream_core::rate::RollingRate;
use deskstream_core::EncoderStats;

struct Inner {
    started: Instant,
    stats: EncoderStats,
    window: RollingRate,
}

/// Encoder counters behind a single lock. Rates are wall clock.
pub struct EncoderStatsTracker {
    inner: Mutex<Inner>,
}

impl Default for EncoderStatsTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                started: Instant::now(),
                stats: EncoderStats::default(),
                window: RollingRate::default(),
            }),
        }
    }
}

impl EncoderStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, now: Instant) {
        let mut inner = self.lock();
        inner.started = now;
        inner.stats = EncoderStats::default();
        inner.window.clear();
    }

    pub fn record_frame(&self, now: Instant) {
        let mut inner = self.lock();
        inner.stats.frames_encoded += 1;
        let elapsed = now.duration_since(inner.started).as_secs_f32();
        if elapsed > 0.0 {
            inner.stats.average_fps = inner.stats.frames_encoded as f32 / elapsed;
        }
    }

    pub fn record_packet(&self, now: Instant, bytes: u64, keyframe: bool) {
        let mut inner = self.lock();
        inner.stats.packets_generated += 1;
        inner.stats.bytes_encoded += bytes;
        if keyframe {
            inner.stats.key_frames += 1;
        }
        inner.window.record(now, bytes);
        inner.stats.current_bitrate = inner.window.bits_per_sec(now);
    }

    pub fn snapshot(&self) -> EncoderStats {
        self.lock().stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
