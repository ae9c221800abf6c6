//! Captured RGB frames into the encoder's YUV 4:2:0 layout.
//!
//! Colour conversion and scaling go through GStreamer's `VideoConverter`
//! between two `VideoInfo`s. The destination info is the one the appsrc caps
//! are built from, so the matrix applied to the pixels is the colorimetry the
//! stream announces.

use deskstream_core::{EncoderError, Frame, PixelFormat, Resolution};
use gstreamer as gst;
use gstreamer_video as gst_video;
use gstreamer_video::prelude::*;

/// GStreamer layout of a packed capture format. Desktop captures carry no
/// meaningful alpha, so four-byte formats map to their `x` variants.
pub fn source_format(format: PixelFormat) -> Option<gst_video::VideoFormat> {
    match format {
        PixelFormat::Bgra8 => Some(gst_video::VideoFormat::Bgrx),
        PixelFormat::Rgba8 => Some(gst_video::VideoFormat::Rgbx),
        PixelFormat::Rgb8 => Some(gst_video::VideoFormat::Rgb),
        PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Unknown => None,
    }
}

/// Converts frames of one source shape into pooled encoder images.
pub struct FrameConverter {
    src: Resolution,
    format: PixelFormat,
    input: gst_video::VideoInfo,
    output: gst_video::VideoInfo,
    inner: gst_video::VideoConverter,
}

impl FrameConverter {
    /// Converter from `src`-sized `format` frames into `output`. A size
    /// mismatch is resolved with nearest-neighbour scaling.
    pub fn new(
        src: Resolution,
        format: PixelFormat,
        output: &gst_video::VideoInfo,
    ) -> Result<Self, EncoderError> {
        let converter_err = |reason: String| EncoderError::Converter { reason };
        let video_format = source_format(format)
            .ok_or_else(|| converter_err(format!("unsupported source format {format:?}")))?;
        if src.width == 0 || src.height == 0 {
            return Err(converter_err(format!("empty source {src}")));
        }
        if output.width() % 2 != 0 || output.height() % 2 != 0 {
            return Err(converter_err(format!(
                "destination {}x{} must be even",
                output.width(),
                output.height()
            )));
        }

        // The converter never changes framerate, so both sides share it
        let input = gst_video::VideoInfo::builder(video_format, src.width, src.height)
            .fps(output.fps())
            .build()
            .map_err(|e| converter_err(format!("source info: {e}")))?;

        let mut config = gst_video::VideoConverterConfig::new();
        config.set_resampler_method(gst_video::VideoResamplerMethod::Nearest);
        config.set_dither_method(gst_video::VideoDitherMethod::None);
        let inner = gst_video::VideoConverter::new(&input, output, Some(config))
            .map_err(|e| converter_err(format!("{src} {format:?} → {:?}: {e}", output.format())))?;

        Ok(Self { src, format, input, output: output.clone(), inner })
    }

    /// Whether a frame of this shape can go through this converter as is.
    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.src.width == width && self.src.height == height && self.format == format
    }

    pub fn source(&self) -> Resolution {
        self.src
    }

    pub fn destination(&self) -> Resolution {
        Resolution::new(self.output.width(), self.output.height())
    }

    pub fn output_info(&self) -> &gst_video::VideoInfo {
        &self.output
    }

    /// Convert `frame` into `dest`. The frame's pixels move into a GStreamer
    /// buffer without a copy; its stride travels as a `VideoMeta`.
    pub fn convert(
        &self,
        frame: Frame,
        dest: &mut gst_video::VideoFrame<gst_video::video_frame::Writable>,
    ) -> Result<(), EncoderError> {
        let converter_err = |reason: String| EncoderError::Converter { reason };
        if !self.matches(frame.width(), frame.height(), frame.format()) {
            return Err(converter_err(format!(
                "frame {}x{} {:?} does not match converter source {} {:?}",
                frame.width(),
                frame.height(),
                frame.format(),
                self.src,
                self.format
            )));
        }
        check_destination(dest)?;

        let stride = frame.stride() as i32;
        let mut buffer = gst::Buffer::from_mut_slice(frame.into_data());
        gst_video::VideoMeta::add_full(
            buffer.make_mut(),
            gst_video::VideoFrameFlags::empty(),
            self.input.format(),
            self.src.width,
            self.src.height,
            &[0],
            &[stride],
        )
        .map_err(|e| converter_err(format!("source layout: {e}")))?;

        let source = gst_video::VideoFrame::from_buffer_readable(buffer, &self.input)
            .map_err(|_| converter_err("could not map source frame".into()))?;
        self.inner.frame(&source, dest);
        Ok(())
    }
}

impl std::fmt::Debug for FrameConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameConverter")
            .field("src", &self.src)
            .field("format", &self.format)
            .field("output", &self.output.format())
            .finish_non_exhaustive()
    }
}

/// Every plane of `dest` must hold the rows its component needs.
fn check_destination(
    dest: &gst_video::VideoFrame<gst_video::video_frame::Writable>,
) -> Result<(), EncoderError> {
    let strides = dest.plane_stride();
    for plane in 0..dest.n_planes() {
        let stride = strides[plane as usize];
        let len = dest.plane_data(plane).map_or(0, |data| data.len());
        expect_rows(rows_in(len, stride), dest.comp_height(plane))?;
    }
    Ok(())
}

/// Rows a plane of `len` bytes spans at `stride`. The last row may be
/// unpadded.
fn rows_in(len: usize, stride: i32) -> u32 {
    let stride = stride.max(1) as usize;
    len.div_ceil(stride) as u32
}

fn expect_rows(available: u32, expected: u32) -> Result<(), EncoderError> {
    if available < expected {
        return Err(EncoderError::Conversion { written: available, expected });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::YuvLayout;

    fn gst_available() -> bool {
        let ok = gst::init().is_ok();
        if !ok {
            eprintln!("GStreamer unavailable, skipping");
        }
        ok
    }

    fn solid(width: u32, height: u32, stride: u32, bgra: [u8; 4]) -> Frame {
        let mut data = vec![0xAA; (stride * height) as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let i = y * stride as usize + x * 4;
                data[i..i + 4].copy_from_slice(&bgra);
            }
        }
        Frame::new(width, height, stride, PixelFormat::Bgra8, 0, data).unwrap()
    }

    fn output(layout: YuvLayout, width: u32, height: u32) -> gst_video::VideoInfo {
        gst_video::VideoInfo::builder(layout.video_format(), width, height)
            .fps(gst::Fraction::new(30, 1))
            .build()
            .unwrap()
    }

    fn convert(frame: Frame, info: &gst_video::VideoInfo) -> Vec<Vec<u8>> {
        let src = Resolution::new(frame.width(), frame.height());
        let converter = FrameConverter::new(src, frame.format(), info).unwrap();
        let buffer = gst::Buffer::with_size(info.size()).unwrap();
        let mut dest = gst_video::VideoFrame::from_buffer_writable(buffer, info).unwrap();
        converter.convert(frame, &mut dest).unwrap();
        (0..dest.n_planes()).map(|p| dest.plane_data(p).unwrap().to_vec()).collect()
    }

    #[test]
    fn packed_formats_map_to_padded_variants() {
        assert_eq!(source_format(PixelFormat::Bgra8), Some(gst_video::VideoFormat::Bgrx));
        assert_eq!(source_format(PixelFormat::Rgba8), Some(gst_video::VideoFormat::Rgbx));
        assert_eq!(source_format(PixelFormat::Rgb8), Some(gst_video::VideoFormat::Rgb));
        assert_eq!(source_format(PixelFormat::Nv12), None);
        assert_eq!(source_format(PixelFormat::Unknown), None);
    }

    #[test]
    fn row_counts_tolerate_an_unpadded_last_row() {
        assert_eq!(rows_in(64 * 48, 64), 48);
        assert_eq!(rows_in(64 * 47 + 60, 64), 48);
        assert_eq!(rows_in(0, 64), 0);
        assert_eq!(rows_in(10, 0), 10);
        assert_eq!(expect_rows(48, 48), Ok(()));
        assert_eq!(
            expect_rows(47, 48),
            Err(EncoderError::Conversion { written: 47, expected: 48 })
        );
    }

    #[test]
    fn white_and_black_reach_limited_range_extremes() {
        if !gst_available() {
            return;
        }
        let info = output(YuvLayout::I420, 16, 8);
        for (bgra, luma) in [([255, 255, 255, 255], 235u8), ([0, 0, 0, 255], 16u8)] {
            let planes = convert(solid(16, 8, 64, bgra), &info);
            assert_eq!(planes.len(), 3);
            let stride = info.stride()[0] as usize;
            for row in planes[0].chunks(stride) {
                assert!(row[..16].iter().all(|&y| y.abs_diff(luma) <= 1), "{row:?}");
            }
            for chroma in &planes[1..] {
                assert!(chroma.iter().all(|&c| c.abs_diff(128) <= 1));
            }
        }
    }

    #[test]
    fn padded_source_stride_is_honoured() {
        if !gst_available() {
            return;
        }
        // Padding bytes are 0xAA; a stride mix-up would leak them into luma
        let info = output(YuvLayout::Nv12, 8, 4);
        let planes = convert(solid(8, 4, 256, [0, 0, 0, 255]), &info);
        assert_eq!(planes.len(), 2);
        let stride = info.stride()[0] as usize;
        for row in planes[0].chunks(stride) {
            assert!(row[..8].iter().all(|&y| y.abs_diff(16) <= 1), "{row:?}");
        }
    }

    #[test]
    fn scales_to_the_destination_size() {
        if !gst_available() {
            return;
        }
        let info = output(YuvLayout::I420, 32, 16);
        let converter =
            FrameConverter::new(Resolution::new(100, 60), PixelFormat::Bgra8, &info).unwrap();
        assert_eq!(converter.source(), Resolution::new(100, 60));
        assert_eq!(converter.destination(), Resolution::new(32, 16));
        assert!(converter.matches(100, 60, PixelFormat::Bgra8));
        assert!(!converter.matches(100, 60, PixelFormat::Rgba8));

        let planes = convert(solid(100, 60, 512, [255, 255, 255, 255]), &info);
        let stride = info.stride()[0] as usize;
        assert!(planes[0].len() >= stride * 15 + 32);
        assert!(planes[0][..32].iter().all(|&y| y.abs_diff(235) <= 1));
    }

    #[test]
    fn rejects_mismatched_frames_and_unusable_shapes() {
        if !gst_available() {
            return;
        }
        let info = output(YuvLayout::I420, 16, 8);
        assert!(matches!(
            FrameConverter::new(Resolution::new(16, 8), PixelFormat::Nv12, &info),
            Err(EncoderError::Converter { .. })
        ));
        assert!(matches!(
            FrameConverter::new(Resolution::new(0, 8), PixelFormat::Bgra8, &info),
            Err(EncoderError::Converter { .. })
        ));

        let converter =
            FrameConverter::new(Resolution::new(16, 8), PixelFormat::Bgra8, &info).unwrap();
        let buffer = gst::Buffer::with_size(info.size()).unwrap();
        let mut dest = gst_video::VideoFrame::from_buffer_writable(buffer, &info).unwrap();
        let err = converter.convert(solid(8, 8, 32, [0, 0, 0, 255]), &mut dest).unwrap_err();
        assert!(matches!(err, EncoderError::Converter { .. }), "{err:?}");
    }
}
