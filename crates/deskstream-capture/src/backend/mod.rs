//! Platform capture backends behind one tagged type.
//!
//! | Variant | Platform | Source |
//! |---------|----------|--------|
//! | `DesktopDuplication` | Windows 8+ | DXGI output duplication + D3D11 staging copy |
//! | `ScreenSession` | Linux (feature `pipewire`) | XDG ScreenCast portal + `pipewiresrc` |
//! | `Synthetic` | any | generated BGRA test pattern with fault injection |
//!
//! `capture_frame` hands out a [`MappedFrame`] that borrows the backend
//! mutably. The pixels it exposes live in backend-owned memory and are
//! released when the guard drops, so a second capture cannot start while a
//! mapping is still alive.

use deskstream_core::{
    BackendKind, CaptureError, CaptureSettings, Frame, FrameError, MonitorInfo, PixelFormat,
    Resolution,
};

#[cfg(target_os = "linux")]
pub mod drm;
#[cfg(target_os = "windows")]
pub mod duplication;
#[cfg(all(target_os = "linux", feature = "pipewire"))]
pub mod session;
pub mod synthetic;

pub use synthetic::{SyntheticControl, SyntheticSource};

// ── CaptureBackend ───────────────────────────────────────────────────

pub enum CaptureBackend {
    #[cfg(target_os = "windows")]
    DesktopDuplication(duplication::DesktopDuplication),
    #[cfg(all(target_os = "linux", feature = "pipewire"))]
    ScreenSession(session::ScreenSession),
    Synthetic(SyntheticSource),
}

/// Forward a call to whichever variant is active.
macro_rules! dispatch {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            #[cfg(target_os = "windows")]
            CaptureBackend::DesktopDuplication($b) => $body,
            #[cfg(all(target_os = "linux", feature = "pipewire"))]
            CaptureBackend::ScreenSession($b) => $body,
            CaptureBackend::Synthetic($b) => $body,
        }
    };
}

impl CaptureBackend {
    /// Construct the variant selected by `settings.backend`. Nothing is bound
    /// to a display until [`initialize`](Self::initialize).
    pub fn create(settings: &CaptureSettings) -> Result<Self, CaptureError> {
        match settings.backend {
            BackendKind::Synthetic => {
                Ok(Self::Synthetic(SyntheticSource::new(settings.synthetic.clone())))
            }
            BackendKind::DesktopDuplication => desktop_duplication(),
            BackendKind::ScreenSession => screen_session(),
            BackendKind::Auto if cfg!(target_os = "windows") => desktop_duplication(),
            BackendKind::Auto if cfg!(target_os = "linux") => screen_session(),
            BackendKind::Auto => Err(CaptureError::Unsupported {
                backend: format!("auto ({})", std::env::consts::OS),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(target_os = "windows")]
            Self::DesktopDuplication(_) => "desktop-duplication",
            #[cfg(all(target_os = "linux", feature = "pipewire"))]
            Self::ScreenSession(_) => "screen-session",
            Self::Synthetic(_) => "synthetic",
        }
    }

    /// Bind to display output `output_index`. Idempotent for the output that
    /// is already bound.
    pub fn initialize(&mut self, output_index: usize) -> Result<(), CaptureError> {
        dispatch!(self, b => b.initialize(output_index))
    }

    /// Wait up to `timeout_ms` for a new desktop image.
    ///
    /// `Ok(None)` means nothing new arrived in time. `Err(AccessLost)` leaves
    /// the backend uninitialized.
    pub fn capture_frame(
        &mut self,
        timeout_ms: u32,
    ) -> Result<Option<MappedFrame<'_>>, CaptureError> {
        dispatch!(self, b => b.capture_frame(timeout_ms))
    }

    pub fn shutdown(&mut self) {
        dispatch!(self, b => b.shutdown())
    }

    pub fn is_initialized(&self) -> bool {
        dispatch!(self, b => b.is_initialized())
    }

    pub fn native_resolution(&self) -> Option<Resolution> {
        dispatch!(self, b => b.native_resolution())
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        dispatch!(self, b => b.last_error())
    }

    pub fn monitors(&self) -> Vec<MonitorInfo> {
        dispatch!(self, b => b.monitors())
    }
}

impl std::fmt::Debug for CaptureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBackend")
            .field("variant", &self.name())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(target_os = "windows")]
fn desktop_duplication() -> Result<CaptureBackend, CaptureError> {
    Ok(CaptureBackend::DesktopDuplication(duplication::DesktopDuplication::new()))
}

#[cfg(not(target_os = "windows"))]
fn desktop_duplication() -> Result<CaptureBackend, CaptureError> {
    Err(CaptureError::Unsupported { backend: "desktop-duplication".into() })
}

#[cfg(all(target_os = "linux", feature = "pipewire"))]
fn screen_session() -> Result<CaptureBackend, CaptureError> {
    Ok(CaptureBackend::ScreenSession(session::ScreenSession::new()))
}

#[cfg(not(all(target_os = "linux", feature = "pipewire")))]
fn screen_session() -> Result<CaptureBackend, CaptureError> {
    Err(CaptureError::Unsupported { backend: "screen-session".into() })
}

// ── MappedFrame ──────────────────────────────────────────────────────

/// Scoped view of one captured image in backend-owned memory.
pub struct MappedFrame<'a> {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    timestamp_us: u64,
    pixels: Pixels<'a>,
}

/// Backend-specific mapping. Each variant releases its mapping in `Drop`.
pub(crate) enum Pixels<'a> {
    #[cfg(target_os = "windows")]
    Duplication(duplication::DuplicationMapping<'a>),
    #[cfg(all(target_os = "linux", feature = "pipewire"))]
    Session(session::SessionMapping<'a>),
    Synthetic(synthetic::SyntheticMapping<'a>),
}

impl<'a> Pixels<'a> {
    fn as_slice(&self) -> &[u8] {
        match self {
            #[cfg(target_os = "windows")]
            Self::Duplication(m) => m.as_slice(),
            #[cfg(all(target_os = "linux", feature = "pipewire"))]
            Self::Session(m) => m.as_slice(),
            Self::Synthetic(m) => m.as_slice(),
        }
    }
}

impl<'a> MappedFrame<'a> {
    pub(crate) fn new(
        resolution: Resolution,
        stride: u32,
        format: PixelFormat,
        timestamp_us: u64,
        pixels: Pixels<'a>,
    ) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            stride,
            format,
            timestamp_us,
            pixels,
        }
    }

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn stride(&self) -> u32 { self.stride }
    pub fn format(&self) -> PixelFormat { self.format }
    pub fn timestamp_us(&self) -> u64 { self.timestamp_us }

    /// Mapped bytes. May be longer than `stride * height`.
    pub fn data(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    /// Copy the mapped image into an owned [`Frame`].
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::copy_from(
            self.width,
            self.height,
            self.stride,
            self.format,
            self.timestamp_us,
            self.data(),
        )
    }
}

impl std::fmt::Debug for MappedFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("timestamp_us", &self.timestamp_us)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_backend_is_always_constructible() {
        let settings = CaptureSettings { backend: BackendKind::Synthetic, ..Default::default() };
        let backend = CaptureBackend::create(&settings).unwrap();
        assert_eq!(backend.name(), "synthetic");
        assert!(!backend.is_initialized());
        assert_eq!(backend.monitors().len(), 1);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn desktop_duplication_is_unsupported_off_windows() {
        let settings = CaptureSettings {
            backend: BackendKind::DesktopDuplication,
            ..Default::default()
        };
        assert!(matches!(
            CaptureBackend::create(&settings),
            Err(CaptureError::Unsupported { .. })
        ));
    }
}
