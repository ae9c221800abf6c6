//! Process-wide monotonic clock for capture timestamps.

use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds elapsed since the first call in this process.
pub fn monotonic_us() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

/// Hands out strictly increasing timestamps even when two reads of the
/// underlying clock land in the same microsecond.
#[derive(Debug, Default)]
pub struct TimestampSource {
    last: Option<u64>,
}

impl TimestampSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        let now = monotonic_us();
        let ts = match self.last {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        self.last = Some(ts);
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let mut source = TimestampSource::new();
        let mut prev = source.next();
        for _ in 0..1000 {
            let ts = source.next();
            assert!(ts > prev);
            prev = ts;
        }
    }
}
