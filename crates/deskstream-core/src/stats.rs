//! Stats snapshots handed out by value to callers.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    /// Frames evicted from the queue on overflow.
    pub frames_dropped: u64,
    pub bytes_captured: u64,
    /// Since capture start.
    pub average_fps: f32,
    /// Over the last second.
    pub current_fps: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_encoded: u64,
    pub packets_generated: u64,
    pub key_frames: u64,
    /// Since encoder initialization, wall clock.
    pub average_fps: f32,
    /// Bits per second over the last second.
    pub current_bitrate: f32,
}
