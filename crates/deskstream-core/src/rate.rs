use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling one-second window of events and their byte sizes.
///
/// Backs the `current_fps` / `current_bitrate` fields of the stats snapshots.
#[derive(Debug, Clone)]
pub struct RollingRate {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for RollingRate {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl RollingRate {
    pub fn new(window: Duration) -> Self {
        Self { window, samples: VecDeque::with_capacity(128) }
    }

    /// Call once per event (frame or packet).
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    pub fn events_per_sec(&mut self, now: Instant) -> f32 {
        self.evict(now);
        self.samples.len() as f32 / self.window.as_secs_f32()
    }

    pub fn bits_per_sec(&mut self, now: Instant) -> f32 {
        self.evict(now);
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        (bytes as f32 * 8.0) / self.window.as_secs_f32()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn evict(&mut self, now: Instant) {
        while self
            .samples
            .front()
            .map_or(false, |(t, _)| now.duration_since(*t) > self.window)
        {
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_samples_older_than_window() {
        let start = Instant::now();
        let mut rate = RollingRate::default();
        for i in 0..10 {
            rate.record(start + Duration::from_millis(i * 100), 1_000);
        }
        assert_eq!(rate.events_per_sec(start + Duration::from_millis(900)), 10.0);
        assert_eq!(rate.bits_per_sec(start + Duration::from_millis(900)), 80_000.0);

        // 1.55 s later only the samples at 0.6 s .. 0.9 s remain
        assert_eq!(rate.events_per_sec(start + Duration::from_millis(1550)), 4.0);
    }
}
