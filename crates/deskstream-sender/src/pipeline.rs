//! Capture → encode → sink loop for one monitor.
//!
//! ```text
//! CaptureEngine (capture thread) ─get_next_frame─► VideoEncoder ─get_encoded_packet─► PacketSink
//! ```
//!
//! Runs on the calling thread until the stop flag is raised, `max_frames` is
//! reached, or capture is lost for good.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use deskstream_capture::CaptureEngine;
use deskstream_core::{CaptureStats, EncoderConfig, EncoderError, EncoderStats};
use deskstream_encoder::VideoEncoder;
use tracing::{debug, info, warn};

use crate::settings::SenderConfig;
use crate::sink::PacketSink;

/// How long one pull from the capture queue may block before the stop flag
/// is checked again.
const POLL_MS: u32 = 100;

// ── Status ───────────────────────────────────────────────────────────────────

/// Final (or periodic) counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStatus {
    pub frames_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    /// Frames the encoder rejected and the loop skipped.
    pub encode_errors: u64,
    pub capture: CaptureStats,
    pub encoder: EncoderStats,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "captured {} ({} dropped, {:.1} fps) → encoded {} → {} packets, {} KiB ({:.0} kbps)",
            self.capture.frames_captured,
            self.capture.frames_dropped,
            self.capture.current_fps,
            self.frames_in,
            self.packets_out,
            self.bytes_out / 1024,
            self.encoder.current_bitrate / 1000.0
        )
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline<'a> {
    config: SenderConfig,
    engine: CaptureEngine,
    encoder: VideoEncoder,
    sink: &'a mut dyn PacketSink,
    status: PipelineStatus,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: SenderConfig, engine: CaptureEngine, sink: &'a mut dyn PacketSink) -> Self {
        Self {
            config,
            engine,
            encoder: VideoEncoder::new(),
            sink,
            status: PipelineStatus::default(),
        }
    }

    /// Run until `stop` is set. Always tears capture and encoder down.
    pub fn run(mut self, stop: &AtomicBool) -> Result<PipelineStatus> {
        let result = self.start().and_then(|_| self.pump(stop));
        let teardown = self.finish();
        result.and(teardown)?;
        Ok(self.status)
    }

    fn start(&mut self) -> Result<()> {
        self.engine
            .initialize()
            .with_context(|| format!("Initializing {} capture", self.engine.backend_name()))?;

        let encoder_config = self.encoder_config();
        self.encoder
            .initialize(encoder_config)
            .context("Initializing encoder")?;
        info!(
            "Encoding with {} ({})",
            self.encoder.codec_name().unwrap_or("?"),
            if self.encoder.is_hardware_accelerated() { "hardware" } else { "software" }
        );

        self.engine.start_capture().context("Starting capture")?;
        Ok(())
    }

    /// Encoder settings with the size taken from the monitor when
    /// `match_capture` is on. 4:2:0 needs even dimensions.
    fn encoder_config(&self) -> EncoderConfig {
        let mut config = self.config.encoder.clone();
        if self.config.match_capture {
            if let Some(native) = self.engine.native_resolution() {
                let (width, height) = (native.width & !1, native.height & !1);
                if width > 0 && height > 0 && (width, height) != (config.width, config.height) {
                    debug!("Encoder size follows capture: {}x{}", width, height);
                    config.width = width;
                    config.height = height;
                }
            }
        }
        config
    }

    fn pump(&mut self, stop: &AtomicBool) -> Result<()> {
        let interval = Duration::from_secs(self.config.stats_interval_secs);
        let mut last_report = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            if self.config.max_frames.is_some_and(|max| self.status.frames_in >= max) {
                info!("Reached {} frames", self.status.frames_in);
                break;
            }

            let Some(frame) = self.engine.get_next_frame(POLL_MS) else {
                let recovering = self.engine.settings().reinitialize_on_access_lost;
                if !self.engine.is_capturing() || (!self.engine.is_initialized() && !recovering) {
                    bail!("Capture lost and not recoverable");
                }
                continue;
            };

            match self.encoder.encode_frame(frame) {
                Ok(()) => self.status.frames_in += 1,
                Err(e @ EncoderError::Pipeline(_)) => return Err(e).context("Encoder failed"),
                Err(e) => {
                    self.status.encode_errors += 1;
                    warn!("Skipping frame: {}", e);
                }
            }
            self.drain()?;

            if !interval.is_zero() && last_report.elapsed() >= interval {
                self.refresh_stats();
                info!("{}", self.status);
                last_report = Instant::now();
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(packet) = self.encoder.get_encoded_packet() {
            self.sink.send(&packet).context("Sink rejected packet")?;
            self.status.packets_out += 1;
            self.status.bytes_out += packet.len() as u64;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.engine.stop_capture();
        self.encoder.shutdown();
        let drained = self.drain();
        let flushed = self.sink.flush();
        self.refresh_stats();
        self.engine.shutdown();
        info!("Pipeline finished: {}", self.status);
        drained.and(flushed)
    }

    fn refresh_stats(&mut self) {
        self.status.capture = self.engine.get_stats();
        self.status.encoder = self.encoder.get_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::DiscardSink;
    use deskstream_capture::{CaptureBackend, SyntheticSource};
    use deskstream_core::{BackendKind, CaptureSettings, SyntheticSettings};

    fn synthetic_engine() -> CaptureEngine {
        let settings = CaptureSettings {
            backend: BackendKind::Synthetic,
            target_fps: 120,
            synthetic: SyntheticSettings { width: 96, height: 64, fps: 120, monitors: 1 },
            ..Default::default()
        };
        let source = SyntheticSource::new(settings.synthetic.clone());
        CaptureEngine::with_backend(settings, CaptureBackend::Synthetic(source))
    }

    fn x264_config(max_frames: u64) -> SenderConfig {
        let mut config = SenderConfig {
            max_frames: Some(max_frames),
            stats_interval_secs: 0,
            ..Default::default()
        };
        config.encoder.hardware_acceleration = false;
        config.encoder.encoder_priority = vec!["x264enc".into()];
        config
    }

    fn x264_available() -> bool {
        let ok = gstreamer::init().is_ok() && gstreamer::ElementFactory::find("x264enc").is_some();
        if !ok {
            eprintln!("GStreamer x264enc unavailable, skipping");
        }
        ok
    }

    #[test]
    fn synthetic_capture_reaches_the_sink() {
        if !x264_available() {
            return;
        }
        let mut sink = DiscardSink::default();
        let stop = AtomicBool::new(false);
        let status = Pipeline::new(x264_config(15), synthetic_engine(), &mut sink)
            .run(&stop)
            .unwrap();

        assert_eq!(status.frames_in, 15);
        assert_eq!(status.encoder.frames_encoded, 15);
        assert_eq!(status.packets_out, sink.packets);
        assert!(sink.packets > 0);
        assert!(sink.keyframes >= 1);
        assert_eq!(status.bytes_out, sink.bytes);
    }

    #[test]
    fn stop_flag_ends_the_run_immediately() {
        if !x264_available() {
            return;
        }
        let mut sink = DiscardSink::default();
        let stop = AtomicBool::new(true);
        let status = Pipeline::new(x264_config(1_000), synthetic_engine(), &mut sink)
            .run(&stop)
            .unwrap();
        assert_eq!(status.frames_in, 0);
    }

    #[test]
    fn invalid_encoder_config_fails_before_capture_starts() {
        let mut sink = DiscardSink::default();
        let mut config = x264_config(1);
        config.match_capture = false;
        config.encoder.width = 0;
        let err = Pipeline::new(config, synthetic_engine(), &mut sink)
            .run(&AtomicBool::new(false))
            .unwrap_err();
        assert!(format!("{err:#}").contains("Initializing encoder"), "{err:#}");
    }
}
