//! The encode session: pipeline construction, frame submission and packet
//! retrieval.
//!
//! ```text
//!   Uninitialized ──initialize──► Initialized ──encode_frame──► Encoding
//!         │                           │                            │
//!         └──────────── shutdown ─────┴──────────► Shutdown ◄──────┘
//! ```

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use deskstream_core::{EncodedPacket, EncoderConfig, EncoderError, EncoderStats, Frame, PixelFormat, Resolution, VideoCodec};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video as gst_video;
use gstreamer_video::prelude::*;
use tracing::{debug, info, info_span, warn, Span};

use crate::candidates::{self, EncoderCandidate};
use crate::convert::FrameConverter;
use crate::props;
use crate::settings::{self, RateControl};
use crate::stats::EncoderStatsTracker;

/// How long `shutdown` waits for the encoder to flush.
const EOS_TIMEOUT: gst::ClockTime = gst::ClockTime::from_seconds(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Initialized,
    Encoding,
    Shutdown,
}

// ── Session ──────────────────────────────────────────────────────────────────

/// One running `appsrc → encoder → capsfilter → parser → appsink` pipeline.
struct Session {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    bus: gst::Bus,
    encoder: gst::Element,
    candidate: EncoderCandidate,
    rate: RateControl,
    info: gst_video::VideoInfo,
    pool: gst_video::VideoBufferPool,
    converter: FrameConverter,
    frame_duration_ns: u64,
    next_pts: u64,
}

impl Session {
    fn open(candidate: &EncoderCandidate, config: &EncoderConfig) -> Result<Self, EncoderError> {
        let open_err = |reason: String| EncoderError::CodecOpen {
            element: candidate.element.clone(),
            reason,
        };
        let format = candidate.input.video_format();
        let fps = gst::Fraction::new(config.framerate as i32, 1);

        // Caps come from the same info the converter targets, colorimetry included
        let info = gst_video::VideoInfo::builder(format, config.width, config.height)
            .fps(fps)
            .build()
            .map_err(|e| open_err(format!("video info: {e}")))?;
        let raw_caps = info.to_caps().map_err(|e| open_err(format!("raw caps: {e}")))?;

        let pipeline = gst::Pipeline::builder()
            .name(format!("encode-{}", candidate.element))
            .build();
        let appsrc = AppSrc::builder()
            .name("src")
            .caps(&raw_caps)
            .format(gst::Format::Time)
            .is_live(true)
            .build();
        let encoder = gst::ElementFactory::make(&candidate.element)
            .name("encoder")
            .build()
            .map_err(|e| open_err(e.to_string()))?;
        let rate = settings::apply(&encoder, candidate, config);
        let filter = gst::ElementFactory::make("capsfilter")
            .property("caps", output_caps(candidate.codec, config))
            .build()
            .map_err(|e| open_err(format!("capsfilter: {e}")))?;
        let parser = match gst::ElementFactory::make(candidate.parser()).build() {
            Ok(parser) => Some(parser),
            Err(_) => {
                warn!("{} not found; packets leave the encoder unparsed", candidate.parser());
                None
            }
        };
        let appsink = AppSink::builder().name("sink").sync(false).build();

        let mut chain: Vec<&gst::Element> = vec![appsrc.upcast_ref(), &encoder, &filter];
        chain.extend(parser.as_ref());
        chain.push(appsink.upcast_ref());
        pipeline
            .add_many(chain.iter().copied())
            .map_err(|e| open_err(format!("adding elements: {e}")))?;
        gst::Element::link_many(chain.iter().copied())
            .map_err(|e| open_err(format!("linking: {e}")))?;

        let bus = pipeline.bus().ok_or_else(|| open_err("pipeline has no bus".into()))?;
        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let reason = bus_error(&bus).unwrap_or_else(|| e.to_string());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_err(reason));
        }
        if let Some(reason) = bus_error(&bus) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_err(reason));
        }

        let pool = gst_video::VideoBufferPool::new();
        let mut pool_config = pool.config();
        pool_config.set_params(Some(&raw_caps), info.size() as u32, 2, 0);
        let pooled = pool
            .set_config(pool_config)
            .and_then(|_| pool.set_active(true))
            .map_err(|e| open_err(format!("buffer pool: {e}")));
        if let Err(e) = pooled {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(e);
        }

        let converter = match FrameConverter::new(config.resolution(), PixelFormat::Bgra8, &info) {
            Ok(converter) => converter,
            Err(e) => {
                let _ = pipeline.set_state(gst::State::Null);
                let _ = pool.set_active(false);
                return Err(e);
            }
        };
        debug!("Raw input {}", raw_caps);

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            bus,
            encoder,
            candidate: candidate.clone(),
            rate,
            info,
            pool,
            converter,
            frame_duration_ns: config.frame_duration_ns(),
            next_pts: 0,
        })
    }

    /// Rebuild the converter when the incoming frame's shape changes.
    fn converter_for(&mut self, frame: &Frame) -> Result<&FrameConverter, EncoderError> {
        if !self.converter.matches(frame.width(), frame.height(), frame.format()) {
            let src = Resolution::new(frame.width(), frame.height());
            debug!(
                "Source changed to {} {:?}, scaling to {}",
                src,
                frame.format(),
                self.converter.destination()
            );
            self.converter = FrameConverter::new(src, frame.format(), &self.info)?;
        }
        Ok(&self.converter)
    }

    fn submit(&mut self, frame: Frame) -> Result<(), EncoderError> {
        let submit_err = |reason: String| EncoderError::Submit { reason };

        let buffer = self
            .pool
            .acquire_buffer(None)
            .map_err(|e| submit_err(format!("buffer pool: {e:?}")))?;
        let info = self.info.clone();
        let mut video = gst_video::VideoFrame::from_buffer_writable(buffer, &info)
            .map_err(|_| submit_err("could not map pool buffer".into()))?;
        let converter = self.converter_for(&frame)?;
        converter.convert(frame, &mut video)?;

        let mut buffer = video.into_buffer();
        {
            let buf = buffer.make_mut();
            buf.set_pts(gst::ClockTime::from_nseconds(self.next_pts * self.frame_duration_ns));
            buf.set_duration(gst::ClockTime::from_nseconds(self.frame_duration_ns));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| submit_err(format!("appsrc push: {e:?}")))?;
        self.next_pts += 1;
        Ok(())
    }

    fn pull(&self) -> Option<EncodedPacket> {
        let sample = self.appsink.try_pull_sample(gst::ClockTime::ZERO)?;
        let buffer = sample.buffer()?;
        let map = buffer.map_readable().ok()?;
        Some(EncodedPacket {
            data: Bytes::copy_from_slice(map.as_slice()),
            pts: frame_index(buffer.pts(), self.frame_duration_ns),
            is_keyframe: is_keyframe(buffer.flags()),
            codec: self.candidate.codec,
        })
    }

    /// End of stream, bounded wait for the flush, then everything still in
    /// the appsink. Leaves the pipeline in `Null`.
    fn close(&self) -> Vec<EncodedPacket> {
        if self.appsrc.end_of_stream().is_ok() {
            let msg = self
                .bus
                .timed_pop_filtered(EOS_TIMEOUT, &[gst::MessageType::Eos, gst::MessageType::Error]);
            match msg.as_ref().map(|m| m.view()) {
                Some(gst::MessageView::Eos(_)) => debug!("Encoder flushed"),
                Some(gst::MessageView::Error(err)) => warn!("Encoder error while flushing: {}", err.error()),
                _ => warn!("Encoder did not reach EOS within {}", EOS_TIMEOUT),
            }
        }
        let flushed: Vec<EncodedPacket> = std::iter::from_fn(|| self.pull()).collect();
        let _ = self.pipeline.set_state(gst::State::Null);
        let _ = self.pool.set_active(false);
        flushed
    }
}

fn output_caps(codec: VideoCodec, config: &EncoderConfig) -> gst::Caps {
    let mut caps = gst::Caps::builder(codec.caps_name());
    if codec != VideoCodec::Av1 {
        caps = caps.field("stream-format", "byte-stream").field("alignment", "au");
        if let Some(profile) = config.profile.caps_value(codec) {
            caps = caps.field("profile", profile);
        }
    }
    caps.build()
}

/// Encoders flag everything but sync points as delta units.
fn is_keyframe(flags: gst::BufferFlags) -> bool {
    !flags.contains(gst::BufferFlags::DELTA_UNIT)
}

/// Frame counter a packet's PTS was stamped from.
fn frame_index(pts: Option<gst::ClockTime>, frame_duration_ns: u64) -> u64 {
    pts.map_or(0, |t| t.nseconds() / frame_duration_ns.max(1))
}

fn bus_error(bus: &gst::Bus) -> Option<String> {
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(match err.debug() {
            Some(debug) => format!("{} ({})", err.error(), debug),
            None => err.error().to_string(),
        }),
        _ => None,
    }
}

// ── VideoEncoder ─────────────────────────────────────────────────────────────

/// Encodes captured frames into H.264 / H.265 / AV1 packets.
///
/// Call [`encode_frame`](Self::encode_frame) for every frame, then drain
/// [`get_encoded_packet`](Self::get_encoded_packet) until it returns `None`.
/// After [`shutdown`](Self::shutdown) the flushed tail is still retrievable.
pub struct VideoEncoder {
    config: EncoderConfig,
    state: EncoderState,
    session: Option<Session>,
    backlog: VecDeque<EncodedPacket>,
    stats: EncoderStatsTracker,
    span: Option<Span>,
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder {
    pub fn new() -> Self {
        Self {
            config: EncoderConfig::default(),
            state: EncoderState::Uninitialized,
            session: None,
            backlog: VecDeque::new(),
            stats: EncoderStatsTracker::new(),
            span: None,
        }
    }

    /// Log under `span` instead of the default `encoder{codec}`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Select, configure and start an encoder for `config`. An existing
    /// session is shut down and replaced.
    pub fn initialize(&mut self, config: EncoderConfig) -> Result<(), EncoderError> {
        config.validate()?;
        let span = self
            .span
            .get_or_insert_with(|| info_span!("encoder", codec = %config.codec))
            .clone();
        let _enter = span.enter();

        if self.session.is_some() {
            self.shutdown();
        }
        self.session = None;
        self.backlog.clear();
        self.state = EncoderState::Uninitialized;

        gst::init().map_err(|e| EncoderError::Pipeline(format!("GStreamer init failed: {e}")))?;

        let available = candidates::available_candidates(&config);
        let mut last_err = EncoderError::NoEncoder { codec: config.codec.to_string() };
        for candidate in &available {
            match Session::open(candidate, &config) {
                Ok(session) => {
                    info!(
                        "Encoder ready: {} ({}) {}@{} fps, {}, gop {}",
                        candidate.element,
                        if candidate.hardware { "hardware" } else { "software" },
                        config.resolution(),
                        config.framerate,
                        session.rate,
                        config.gop_size
                    );
                    self.session = Some(session);
                    self.config = config;
                    self.state = EncoderState::Initialized;
                    self.stats.reset(Instant::now());
                    return Ok(());
                }
                Err(e) => {
                    warn!("{}, trying next encoder", e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Convert, timestamp and submit one frame. A frame whose size or format
    /// differs from the session is scaled to the configured resolution. The
    /// frame's pixel buffer is handed to GStreamer, not copied.
    pub fn encode_frame(&mut self, frame: Frame) -> Result<(), EncoderError> {
        if !self.is_initialized() {
            return Err(EncoderError::NotInitialized);
        }
        let session = self.session.as_mut().ok_or(EncoderError::NotInitialized)?;
        if let Some(reason) = bus_error(&session.bus) {
            return Err(EncoderError::Pipeline(reason));
        }

        session.submit(frame)?;
        self.stats.record_frame(Instant::now());
        self.state = EncoderState::Encoding;

        if let Some(packet) = session.pull() {
            self.backlog.push_back(packet);
        }
        Ok(())
    }

    /// Next compressed packet, or `None` when nothing is ready yet.
    pub fn get_encoded_packet(&mut self) -> Option<EncodedPacket> {
        let packet = match self.backlog.pop_front() {
            Some(packet) => packet,
            None if self.is_initialized() => self.session.as_ref()?.pull()?,
            None => return None,
        };
        self.stats
            .record_packet(Instant::now(), packet.len() as u64, packet.is_keyframe);
        Some(packet)
    }

    /// Flush and stop the pipeline, then release it along with its buffer
    /// pool and converter. Flushed packets stay retrievable through
    /// `get_encoded_packet`. Does nothing when not running.
    pub fn shutdown(&mut self) {
        if !self.is_initialized() {
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };
        let span = self.span.clone().unwrap_or_else(Span::none);
        let _enter = span.enter();

        let flushed = session.close();
        drop(session);
        debug!("{} packets flushed at shutdown", flushed.len());
        self.backlog.extend(flushed);
        self.state = EncoderState::Shutdown;
        let stats = self.stats.snapshot();
        info!(
            "Encoder stopped: {} frames in, {} packets out, {} pending",
            stats.frames_encoded,
            stats.packets_generated,
            self.backlog.len()
        );
    }

    pub fn get_stats(&self) -> EncoderStats {
        self.stats.snapshot()
    }

    /// GStreamer element name of the selected encoder. `None` once shut down.
    pub fn codec_name(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.candidate.element.as_str())
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.candidate.hardware)
    }

    pub fn rate_control(&self) -> Option<RateControl> {
        self.session.as_ref().map(|s| s.rate)
    }

    /// Current value of an encoder element property, for inspection.
    pub fn codec_property(&self, name: &str) -> Option<String> {
        props::get(&self.session.as_ref()?.encoder, name)
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, EncoderState::Initialized | EncoderState::Encoding)
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        if let Some(session) = self.session.as_ref() {
            let _ = session.pipeline.set_state(gst::State::Null);
            let _ = session.pool.set_active(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_caps_carry_profile_and_alignment() {
        if gst::init().is_err() {
            eprintln!("GStreamer unavailable, skipping");
            return;
        }
        let config = EncoderConfig::default();
        let caps = output_caps(VideoCodec::H264, &config);
        let s = caps.structure(0).expect("one structure");
        assert_eq!(s.name().as_str(), "video/x-h264");
        assert_eq!(s.get::<&str>("stream-format").ok(), Some("byte-stream"));
        assert_eq!(s.get::<&str>("alignment").ok(), Some("au"));
        assert_eq!(s.get::<&str>("profile").ok(), Some("main"));

        let av1 = output_caps(VideoCodec::Av1, &config);
        let s = av1.structure(0).expect("one structure");
        assert_eq!(s.name().as_str(), "video/x-av1");
        assert!(!s.has_field("profile"));
    }

    #[test]
    fn keyframes_are_buffers_without_delta_flag() {
        assert!(is_keyframe(gst::BufferFlags::empty()));
        assert!(is_keyframe(gst::BufferFlags::HEADER));
        assert!(!is_keyframe(gst::BufferFlags::DELTA_UNIT));
        assert!(!is_keyframe(gst::BufferFlags::DELTA_UNIT | gst::BufferFlags::HEADER));
    }

    #[test]
    fn pts_maps_back_to_frame_counter() {
        let dur = 33_333_333;
        assert_eq!(frame_index(None, dur), 0);
        assert_eq!(frame_index(Some(gst::ClockTime::ZERO), dur), 0);
        assert_eq!(frame_index(Some(gst::ClockTime::from_nseconds(7 * dur)), dur), 7);
        assert_eq!(frame_index(Some(gst::ClockTime::from_nseconds(5)), 0), 5);
    }

    #[test]
    fn invalid_config_leaves_encoder_unusable() {
        let mut encoder = VideoEncoder::new();
        let odd = EncoderConfig { width: 1279, ..Default::default() };
        assert!(matches!(encoder.initialize(odd), Err(EncoderError::InvalidConfig { .. })));
        assert_eq!(encoder.state(), EncoderState::Uninitialized);
        assert!(!encoder.is_initialized());

        let frame = Frame::new(2, 2, 8, PixelFormat::Bgra8, 0, vec![0; 16]).unwrap();
        assert_eq!(encoder.encode_frame(frame), Err(EncoderError::NotInitialized));
        assert!(encoder.rate_control().is_none());
        assert!(encoder.codec_property("bitrate").is_none());
        assert_eq!(encoder.get_stats(), EncoderStats::default());
    }

    #[test]
    fn operations_before_initialize() {
        let mut encoder = VideoEncoder::new();
        let frame = Frame::new(2, 2, 8, PixelFormat::Bgra8, 0, vec![0; 16]).unwrap();
        assert_eq!(encoder.encode_frame(frame), Err(EncoderError::NotInitialized));
        assert!(encoder.get_encoded_packet().is_none());
        assert!(encoder.codec_name().is_none());
        encoder.shutdown();
        assert_eq!(encoder.state(), EncoderState::Uninitialized);
    }
}
