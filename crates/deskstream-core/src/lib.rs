pub mod clock;
pub mod config;
pub mod errors;
pub mod frame;
pub mod rate;
pub mod stats;
pub mod types;

pub use config::{BackendKind, CaptureSettings, EncoderConfig, Profile, SpeedPreset, SyntheticSettings};
pub use errors::{CaptureError, EncoderError, FrameError};
pub use frame::{Frame, PixelFormat};
pub use stats::{CaptureStats, EncoderStats};
pub use types::*;
