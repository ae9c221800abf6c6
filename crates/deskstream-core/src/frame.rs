//! Captured frame value object.

use crate::errors::FrameError;

// MARK: - PixelFormat

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    #[default]
    Unknown,
    /// 32-bit B, G, R, A (desktop duplication native).
    Bgra8,
    Rgba8,
    Rgb8,
    /// YUV 4:2:0, three planes.
    Yuv420p,
    /// YUV 4:2:0, luma plane plus interleaved UV plane.
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for planar or unknown ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::Bgra8 | Self::Rgba8 => Some(4),
            Self::Rgb8 => Some(3),
            Self::Yuv420p | Self::Nv12 | Self::Unknown => None,
        }
    }

    pub fn is_packed_rgb(self) -> bool {
        self.bytes_per_pixel().is_some()
    }
}

// MARK: - Frame

/// One captured image plus its metadata.
///
/// The buffer always holds exactly `stride * height` bytes and belongs to this
/// frame alone; producers copy mapped memory in rather than sharing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    timestamp_us: u64,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        timestamp_us: u64,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        if let Some(bpp) = format.bytes_per_pixel() {
            let min_stride = width as usize * bpp;
            if (stride as usize) < min_stride {
                return Err(FrameError::StrideTooSmall { stride, min: min_stride });
            }
        }
        let expected = stride as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::LengthMismatch { expected, actual: data.len() });
        }
        Ok(Self { width, height, stride, format, timestamp_us, data })
    }

    /// Copy `stride * height` bytes out of borrowed (mapped) memory.
    pub fn copy_from(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        timestamp_us: u64,
        src: &[u8],
    ) -> Result<Self, FrameError> {
        let expected = stride as usize * height as usize;
        let bytes = src
            .get(..expected)
            .ok_or(FrameError::LengthMismatch { expected, actual: src.len() })?;
        Self::new(width, height, stride, format, timestamp_us, bytes.to_vec())
    }

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn stride(&self) -> u32 { self.stride }
    pub fn format(&self) -> PixelFormat { self.format }
    pub fn timestamp_us(&self) -> u64 { self.timestamp_us }
    pub fn data(&self) -> &[u8] { &self.data }

    /// Bytes of row `y`, including any trailing padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.stride as usize]
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
