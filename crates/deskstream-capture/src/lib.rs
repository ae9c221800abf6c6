//! deskstream-capture: desktop capture for the deskstream sender.
//!
//! # Capture backends
//!
//! | Backend | Platform | Status |
//! |---------|----------|--------|
//! | Desktop Duplication (DXGI + D3D11) | Windows 8+ | ✓ |
//! | Screen session (ashpd portal + PipeWire + GStreamer) | Linux, feature `pipewire` | ✓ |
//! | Synthetic test pattern | any | ✓ |
//!
//! # Usage
//!
//! ```rust,no_run
//! use deskstream_capture::CaptureEngine;
//! use deskstream_core::CaptureSettings;
//!
//! # fn example() -> Result<(), deskstream_core::CaptureError> {
//! let mut engine = CaptureEngine::new(CaptureSettings::default())?;
//! engine.initialize()?;
//! engine.start_capture()?;
//! while let Some(frame) = engine.get_next_frame(100) {
//!     // frame.data(): stride * height bytes, BGRA
//! #   break;
//! }
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//!  CaptureBackend ──capture_frame──► MappedFrame ──to_frame──► Frame
//!        ▲          (capture thread)                             │
//!        │                                                       ▼
//!   initialize / reinit on access lost              FrameQueue (drop-oldest)
//!                                                                │
//!                                          get_next_frame ◄──────┘
//! ```

pub mod backend;
pub mod engine;
pub mod queue;
pub mod stats;

pub use backend::{CaptureBackend, MappedFrame, SyntheticControl, SyntheticSource};
pub use engine::{CaptureEngine, CaptureState};
pub use queue::FrameQueue;
pub use stats::CaptureStatsTracker;
