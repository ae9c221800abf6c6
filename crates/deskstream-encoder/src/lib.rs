//! deskstream-encoder: GStreamer video encoding for captured desktop frames.
//!
//! # Pipeline
//!
//! ```text
//! Frame (BGRA) ──VideoConverter──► pooled I420 / NV12 buffer (PTS = n / fps)
//!   → appsrc
//!   → <selected encoder>
//!   → video/x-h264|x-h265,stream-format=byte-stream,alignment=au[,profile=…]
//!   → h264parse | h265parse | av1parse
//!   → appsink ──► EncodedPacket
//! ```
//!
//! Encoder selection and per-element property mapping live in
//! [`candidates`] and [`settings`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use deskstream_core::EncoderConfig;
//! use deskstream_encoder::VideoEncoder;
//!
//! # fn example(frames: Vec<deskstream_core::Frame>) -> Result<(), deskstream_core::EncoderError> {
//! let mut encoder = VideoEncoder::new();
//! encoder.initialize(EncoderConfig::default())?;
//! for frame in frames {
//!     encoder.encode_frame(frame)?;
//!     while let Some(packet) = encoder.get_encoded_packet() {
//!         // packet.data: one Annex B access unit
//! #       let _ = packet;
//!     }
//! }
//! encoder.shutdown();
//! while let Some(_tail) = encoder.get_encoded_packet() {}
//! # Ok(())
//! # }
//! ```

pub mod candidates;
pub mod convert;
pub mod encoder;
mod props;
pub mod settings;
pub mod stats;

pub use candidates::{EncoderCandidate, EncoderFamily, YuvLayout};
pub use convert::FrameConverter;
pub use encoder::{EncoderState, VideoEncoder};
pub use settings::RateControl;
pub use stats::EncoderStatsTracker;
