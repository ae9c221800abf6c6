//! Encoder element candidates and selection.
//!
//! # Selection order
//!
//! 1. `EncoderConfig::encoder_priority`, in the order given
//! 2. Platform hardware encoders for the codec (when `hardware_acceleration`)
//! 3. Software fallbacks
//!
//! | Codec | Windows | macOS | Linux | Software |
//! |-------|---------|-------|-------|----------|
//! | H.264 | `nvh264enc` `qsvh264enc` `amfh264enc` `mfh264enc` | `vtenc_h264_hw` | `nvh264enc` `vah264enc` `vaapih264enc` | `x264enc` |
//! | H.265 | `nvh265enc` `qsvh265enc` `amfh265enc` `mfh265enc` | `vtenc_h265_hw` | `nvh265enc` `vah265enc` `vaapih265enc` | `x265enc` |
//! | AV1   | `nvav1enc` `qsvav1enc` `amfav1enc` | | `nvav1enc` `vaav1enc` | `svtav1enc` `av1enc` |

use deskstream_core::{EncoderConfig, VideoCodec};
use gstreamer as gst;
use tracing::{debug, info};
use EncoderFamily as F;
use VideoCodec::{Av1, H264, H265};

/// How an element's rate control, GOP and speed properties are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    X264,
    X265,
    Nvenc,
    /// `va*enc` from the `va` plugin.
    Va,
    /// Legacy `vaapi*enc`.
    Vaapi,
    Qsv,
    Amf,
    MediaFoundation,
    VideoToolbox,
    SvtAv1,
    Aom,
    Generic,
}

impl EncoderFamily {
    pub fn is_hardware(self) -> bool {
        !matches!(self, Self::X264 | Self::X265 | Self::SvtAv1 | Self::Aom | Self::Generic)
    }

    /// Best guess from an element name outside the built-in tables.
    pub fn infer(element: &str) -> Self {
        let e = element.to_ascii_lowercase();
        if e.starts_with("x264") {
            Self::X264
        } else if e.starts_with("x265") {
            Self::X265
        } else if e.starts_with("nv") {
            Self::Nvenc
        } else if e.starts_with("vaapi") {
            Self::Vaapi
        } else if e.starts_with("va") {
            Self::Va
        } else if e.starts_with("qsv") || e.starts_with("msdk") {
            Self::Qsv
        } else if e.starts_with("amf") {
            Self::Amf
        } else if e.starts_with("mf") {
            Self::MediaFoundation
        } else if e.starts_with("vtenc") {
            Self::VideoToolbox
        } else if e.starts_with("svtav1") {
            Self::SvtAv1
        } else if e == "av1enc" || e.starts_with("aom") {
            Self::Aom
        } else {
            Self::Generic
        }
    }
}

/// Raw 4:2:0 layout fed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YuvLayout {
    I420,
    Nv12,
}

impl YuvLayout {
    pub fn video_format(self) -> gstreamer_video::VideoFormat {
        match self {
            Self::I420 => gstreamer_video::VideoFormat::I420,
            Self::Nv12 => gstreamer_video::VideoFormat::Nv12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCandidate {
    pub element: String,
    pub codec: VideoCodec,
    pub family: EncoderFamily,
    pub hardware: bool,
    pub input: YuvLayout,
}

impl EncoderCandidate {
    pub fn new(element: &str, codec: VideoCodec, family: EncoderFamily) -> Self {
        let hardware = family.is_hardware();
        Self {
            element: element.to_string(),
            codec,
            family,
            hardware,
            input: if hardware { YuvLayout::Nv12 } else { YuvLayout::I420 },
        }
    }

    /// Parser placed after the encoder's caps filter.
    pub fn parser(&self) -> &'static str {
        match self.codec {
            VideoCodec::H264 => "h264parse",
            VideoCodec::H265 => "h265parse",
            VideoCodec::Av1 => "av1parse",
        }
    }

    pub fn is_available(&self) -> bool {
        gst::ElementFactory::find(&self.element).is_some()
    }
}

// ── Tables ───────────────────────────────────────────────────────────

type Entry = (&'static str, VideoCodec, EncoderFamily);

#[cfg(target_os = "windows")]
const HARDWARE: &[Entry] = &[
    ("nvh264enc", H264, F::Nvenc),
    ("qsvh264enc", H264, F::Qsv),
    ("amfh264enc", H264, F::Amf),
    ("mfh264enc", H264, F::MediaFoundation),
    ("nvh265enc", H265, F::Nvenc),
    ("qsvh265enc", H265, F::Qsv),
    ("amfh265enc", H265, F::Amf),
    ("mfh265enc", H265, F::MediaFoundation),
    ("nvav1enc", Av1, F::Nvenc),
    ("qsvav1enc", Av1, F::Qsv),
    ("amfav1enc", Av1, F::Amf),
];

#[cfg(target_os = "macos")]
const HARDWARE: &[Entry] = &[
    ("vtenc_h264_hw", H264, F::VideoToolbox),
    ("vtenc_h265_hw", H265, F::VideoToolbox),
];

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const HARDWARE: &[Entry] = &[
    ("nvh264enc", H264, F::Nvenc),
    ("vah264enc", H264, F::Va),
    ("vaapih264enc", H264, F::Vaapi),
    ("nvh265enc", H265, F::Nvenc),
    ("vah265enc", H265, F::Va),
    ("vaapih265enc", H265, F::Vaapi),
    ("nvav1enc", Av1, F::Nvenc),
    ("vaav1enc", Av1, F::Va),
];

const SOFTWARE: &[Entry] = &[
    ("x264enc", H264, F::X264),
    ("x265enc", H265, F::X265),
    ("svtav1enc", Av1, F::SvtAv1),
    ("av1enc", Av1, F::Aom),
];

fn known(element: &str) -> Option<EncoderFamily> {
    HARDWARE
        .iter()
        .chain(SOFTWARE)
        .find(|(name, _, _)| *name == element)
        .map(|(_, _, family)| *family)
}

/// Candidates for `config`, in the order they should be tried. Not filtered
/// by availability.
pub fn candidates(config: &EncoderConfig) -> Vec<EncoderCandidate> {
    let codec = config.codec;
    let mut list: Vec<EncoderCandidate> = config
        .encoder_priority
        .iter()
        .map(|name| {
            let family = known(name).unwrap_or_else(|| EncoderFamily::infer(name));
            EncoderCandidate::new(name, codec, family)
        })
        .collect();

    if config.hardware_acceleration {
        list.extend(
            HARDWARE
                .iter()
                .filter(|(_, c, _)| *c == codec)
                .map(|(name, c, family)| EncoderCandidate::new(name, *c, *family)),
        );
    }
    list.extend(
        SOFTWARE
            .iter()
            .filter(|(_, c, _)| *c == codec)
            .map(|(name, c, family)| EncoderCandidate::new(name, *c, *family)),
    );

    let mut seen = std::collections::HashSet::new();
    list.retain(|c| seen.insert(c.element.clone()));
    list
}

/// Candidates whose element factory is registered. Requires `gst::init()`.
pub fn available_candidates(config: &EncoderConfig) -> Vec<EncoderCandidate> {
    candidates(config)
        .into_iter()
        .filter(|candidate| {
            let found = candidate.is_available();
            if !found {
                debug!("Encoder '{}' not found, trying next", candidate.element);
            }
            found
        })
        .inspect(|c| info!("Encoder candidate: {} (hardware={})", c.element, c.hardware))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_entries_come_first_then_software_last() {
        let config = EncoderConfig {
            encoder_priority: vec!["x264enc".into(), "myvendorenc".into()],
            ..Default::default()
        };
        let list = candidates(&config);
        assert_eq!(list[0].element, "x264enc");
        assert_eq!(list[0].family, EncoderFamily::X264);
        assert_eq!(list[1].element, "myvendorenc");
        assert_eq!(list[1].family, EncoderFamily::Generic);
        // x264enc listed once even though it is also the fallback
        assert_eq!(list.iter().filter(|c| c.element == "x264enc").count(), 1);
        assert!(list.iter().skip(2).all(|c| c.hardware));
    }

    #[test]
    fn software_only_without_hardware_acceleration() {
        let config = EncoderConfig {
            codec: VideoCodec::Av1,
            hardware_acceleration: false,
            ..Default::default()
        };
        let names: Vec<String> = candidates(&config).into_iter().map(|c| c.element).collect();
        assert_eq!(names, vec!["svtav1enc", "av1enc"]);
    }

    #[test]
    fn hardware_candidates_feed_nv12() {
        let config = EncoderConfig { codec: VideoCodec::H265, ..Default::default() };
        let list = candidates(&config);
        for c in &list {
            assert_eq!(c.codec, VideoCodec::H265);
            let expected = if c.hardware { YuvLayout::Nv12 } else { YuvLayout::I420 };
            assert_eq!(c.input, expected, "{}", c.element);
        }
        assert_eq!(list.last().map(|c| c.element.as_str()), Some("x265enc"));
        assert_eq!(list[0].parser(), "h265parse");
    }

    #[test]
    fn infers_families_from_names() {
        assert_eq!(EncoderFamily::infer("vaapih264enc"), EncoderFamily::Vaapi);
        assert_eq!(EncoderFamily::infer("vah264lpenc"), EncoderFamily::Va);
        assert_eq!(EncoderFamily::infer("nvd3d11h264enc"), EncoderFamily::Nvenc);
        assert_eq!(EncoderFamily::infer("msdkh264enc"), EncoderFamily::Qsv);
        assert_eq!(EncoderFamily::infer("openh264enc"), EncoderFamily::Generic);
    }
}
