//! Mapping of [`EncoderConfig`] onto each encoder family's properties.
//!
//! A quality factor (`crf`) always wins over `bitrate`: in quality mode no
//! bitrate property is touched, in bitrate mode no quality property is.

use deskstream_core::{EncoderConfig, SpeedPreset};
use gstreamer as gst;
use tracing::{debug, warn};

use crate::candidates::{EncoderCandidate, EncoderFamily};
use crate::props;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// Quality factor on the 0–51 scale.
    ConstantQuality(u8),
    /// Target bits per second.
    Bitrate(u64),
}

impl std::fmt::Display for RateControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConstantQuality(q) => write!(f, "crf {q}"),
            Self::Bitrate(bps) => write!(f, "{} kbps", bps / 1000),
        }
    }
}

impl RateControl {
    /// Mode `config` asks for: the quality factor when set, bitrate otherwise.
    pub fn requested(config: &EncoderConfig) -> Self {
        match config.crf {
            Some(crf) => Self::ConstantQuality(crf),
            None => Self::Bitrate(config.bitrate),
        }
    }
}

/// Configure `element` for `config`. Returns the rate control in effect.
pub fn apply(element: &gst::Element, candidate: &EncoderCandidate, config: &EncoderConfig) -> RateControl {
    let kbps = (config.bitrate / 1000).max(1) as i64;
    let gop = config.gop_size as i64;
    let bframes = config.effective_b_frames() as i64;

    let quality = match RateControl::requested(config) {
        RateControl::ConstantQuality(crf) if apply_quality(element, candidate.family, crf) => {
            Some(RateControl::ConstantQuality(crf))
        }
        RateControl::ConstantQuality(crf) => {
            warn!(
                "{} has no constant quality mode; ignoring crf {} and using {} kbps",
                candidate.element, crf, kbps
            );
            None
        }
        RateControl::Bitrate(_) => None,
    };
    let rate = quality.unwrap_or_else(|| {
        apply_bitrate(element, candidate.family, kbps);
        RateControl::Bitrate(config.bitrate)
    });

    match candidate.family {
        EncoderFamily::X264 => {
            props::set_nick(element, "speed-preset", config.preset.as_str());
            props::set_number(element, "key-int-max", gop);
            props::set_number(element, "bframes", bframes);
            props::set_number(element, "threads", config.thread_count as i64);
            if config.low_latency {
                props::set_nick(element, "tune", "zerolatency");
            }
        }
        EncoderFamily::X265 => {
            props::set_nick(element, "speed-preset", config.preset.as_str());
            props::set_number(element, "key-int-max", gop);
            if config.low_latency {
                props::set_nick(element, "tune", "zerolatency");
            }
            props::set_string(element, "option-string", &x265_options(bframes, rate, config.thread_count));
        }
        EncoderFamily::Nvenc => {
            props::set_number(element, "gop-size", gop);
            props::set_number(element, "bframes", bframes);
            let presets: &[&str] = if config.low_latency {
                &["low-latency-hq", "p1"]
            } else if config.preset.rank() <= SpeedPreset::Faster.rank() {
                &["hp", "p2"]
            } else if config.preset.rank() >= SpeedPreset::Slow.rank() {
                &["hq", "p6"]
            } else {
                &["default", "p4"]
            };
            props::set_first_nick(element, "preset", presets);
            if config.low_latency {
                props::set_bool(element, "zerolatency", true);
            }
        }
        EncoderFamily::Va => {
            props::set_number(element, "key-int-max", gop);
            props::set_number(element, "b-frames", bframes);
            props::set_number(element, "target-usage", target_usage(config.preset));
        }
        EncoderFamily::Vaapi => {
            props::set_number(element, "keyframe-period", gop);
            props::set_number(element, "max-bframes", bframes);
            props::set_number(element, "quality-level", target_usage(config.preset));
        }
        EncoderFamily::Qsv => {
            props::set_number(element, "gop-size", gop);
            props::set_number(element, "b-frames", bframes);
            props::set_number(element, "target-usage", target_usage(config.preset));
        }
        EncoderFamily::Amf => {
            props::set_number(element, "gop-size", gop);
            props::set_number(element, "b-frames", bframes);
            let preset = match config.preset.rank() {
                0..=3 => "speed",
                4..=5 => "balanced",
                _ => "quality",
            };
            props::set_nick(element, "preset", preset);
            if config.low_latency {
                props::set_first_nick(element, "usage", &["ultra-low-latency", "low-latency"]);
            }
        }
        EncoderFamily::MediaFoundation => {
            props::set_number(element, "gop-size", gop);
            props::set_number(element, "bframes", bframes);
            // 0 = fastest, 100 = best quality
            props::set_number(element, "quality-vs-speed", config.preset.rank() as i64 * 100 / 8);
            props::set_bool(element, "low-latency", config.low_latency);
        }
        EncoderFamily::VideoToolbox => {
            props::set_number(element, "max-keyframe-interval", gop);
            props::set_bool(element, "allow-frame-reordering", bframes > 0);
            props::set_bool(element, "realtime", config.low_latency);
        }
        EncoderFamily::SvtAv1 => {
            props::set_number(element, "intra-period-length", gop);
            // svt presets run 0 (slowest) to 13 (fastest)
            props::set_number(element, "preset", 12 - config.preset.rank() as i64);
        }
        EncoderFamily::Aom => {
            props::set_number(element, "keyframe-max-dist", gop);
            props::set_number(element, "cpu-used", 8 - config.preset.rank() as i64);
            props::set_number(element, "threads", config.thread_count as i64);
            if config.low_latency {
                props::set_nick(element, "usage-profile", "realtime");
            }
        }
        EncoderFamily::Generic => {
            props::set_number(element, "key-int-max", gop) || props::set_number(element, "gop-size", gop);
        }
    }

    debug!("{} configured: {}, gop {}, {} b-frames", candidate.element, rate, gop, bframes);
    rate
}

/// Switch the element to constant quality. `false` when it has no such mode.
fn apply_quality(element: &gst::Element, family: EncoderFamily, crf: u8) -> bool {
    let q = crf as i64;
    match family {
        EncoderFamily::X264 => {
            props::set_nick(element, "pass", "qual") && props::set_number(element, "quantizer", q)
        }
        // Carried in option-string
        EncoderFamily::X265 => props::has(element, "option-string"),
        EncoderFamily::Nvenc => {
            props::set_first_nick(element, "rc-mode", &["vbr", "vbr-hq"]).is_some()
                && props::set_float(element, "const-quality", crf as f64)
        }
        EncoderFamily::Va => {
            props::set_nick(element, "rate-control", "cqp")
                && props::set_number(element, "qpi", q)
                && props::set_number(element, "qpp", q)
                && props::set_number(element, "qpb", q)
        }
        EncoderFamily::Vaapi => {
            props::set_nick(element, "rate-control", "cqp") && props::set_number(element, "init-qp", q)
        }
        EncoderFamily::Qsv => {
            props::set_nick(element, "rate-control", "icq")
                && props::set_number(element, "icq-quality", q)
        }
        EncoderFamily::Amf => {
            props::set_nick(element, "rate-control", "cqp")
                && props::set_number(element, "qp-i", q)
                && props::set_number(element, "qp-p", q)
        }
        EncoderFamily::MediaFoundation => {
            props::set_nick(element, "rc-mode", "quality") && props::set_number(element, "qp", q)
        }
        // quality runs 0.0 (worst) to 1.0 (best)
        EncoderFamily::VideoToolbox => {
            props::set_float(element, "quality", 1.0 - crf as f64 / EncoderConfig::MAX_CRF as f64)
        }
        EncoderFamily::SvtAv1 => {
            // AV1 quantizers run to 63
            props::set_number(element, "crf", q * 63 / EncoderConfig::MAX_CRF as i64)
        }
        EncoderFamily::Aom => {
            props::set_nick(element, "end-usage", "q")
                && props::set_number(element, "cq-level", q * 63 / EncoderConfig::MAX_CRF as i64)
        }
        EncoderFamily::Generic => false,
    }
}

fn apply_bitrate(element: &gst::Element, family: EncoderFamily, kbps: i64) {
    match family {
        EncoderFamily::X264 => {
            props::set_nick(element, "pass", "cbr");
            props::set_number(element, "bitrate", kbps);
        }
        EncoderFamily::Nvenc => {
            props::set_nick(element, "rc-mode", "cbr");
            props::set_number(element, "bitrate", kbps);
        }
        EncoderFamily::Va | EncoderFamily::Vaapi | EncoderFamily::Qsv | EncoderFamily::Amf => {
            props::set_nick(element, "rate-control", "cbr");
            props::set_number(element, "bitrate", kbps);
        }
        EncoderFamily::MediaFoundation => {
            props::set_nick(element, "rc-mode", "cbr");
            props::set_number(element, "bitrate", kbps);
        }
        EncoderFamily::SvtAv1 | EncoderFamily::Aom => {
            props::set_nick(element, "end-usage", "cbr");
            props::set_number(element, "target-bitrate", kbps);
        }
        EncoderFamily::X265 | EncoderFamily::VideoToolbox | EncoderFamily::Generic => {
            props::set_number(element, "bitrate", kbps);
        }
    }
}

/// x265 `option-string`. The quality factor only travels here; the bitrate
/// has its own property.
fn x265_options(bframes: i64, rate: RateControl, threads: u32) -> String {
    let mut options = vec![format!("bframes={bframes}")];
    if let RateControl::ConstantQuality(crf) = rate {
        options.push(format!("crf={crf}"));
    }
    if threads > 0 {
        options.push(format!("pools={threads}"));
    }
    options.join(":")
}

/// Speed preset on the 1 (best quality) – 7 (fastest) target-usage scale.
fn target_usage(preset: SpeedPreset) -> i64 {
    7 - (preset.rank() as i64 * 6 / 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_usage_spans_full_range() {
        assert_eq!(target_usage(SpeedPreset::Ultrafast), 7);
        assert_eq!(target_usage(SpeedPreset::Medium), 4);
        assert_eq!(target_usage(SpeedPreset::Veryslow), 1);
    }

    #[test]
    fn quality_factor_takes_precedence_over_bitrate() {
        let both = EncoderConfig { crf: Some(18), bitrate: 9_000_000, ..Default::default() };
        assert_eq!(RateControl::requested(&both), RateControl::ConstantQuality(18));

        let bitrate_only = EncoderConfig { crf: None, bitrate: 1_500_000, ..Default::default() };
        assert_eq!(RateControl::requested(&bitrate_only), RateControl::Bitrate(1_500_000));
    }

    #[test]
    fn x265_options_carry_crf_only_in_quality_mode() {
        assert_eq!(x265_options(0, RateControl::ConstantQuality(20), 4), "bframes=0:crf=20:pools=4");
        let bitrate = x265_options(2, RateControl::Bitrate(4_000_000), 0);
        assert_eq!(bitrate, "bframes=2");
        assert!(!bitrate.contains("crf"));
    }

    #[test]
    fn rate_control_display() {
        assert_eq!(RateControl::ConstantQuality(23).to_string(), "crf 23");
        assert_eq!(RateControl::Bitrate(4_000_000).to_string(), "4000 kbps");
    }
}
