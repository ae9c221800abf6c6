use serde::{Deserialize, Serialize};

use crate::errors::EncoderError;
use crate::types::{Resolution, VideoCodec};

// MARK: - EncoderConfig

/// Encode session configuration, fixed for the lifetime of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    #[serde(alias = "frameRate", alias = "fps")]
    pub framerate: u32,
    /// Target bitrate in bits per second. Ignored while `crf` is set.
    pub bitrate: u64,
    #[serde(alias = "gopSize")]
    pub gop_size: u32,
    pub codec: VideoCodec,
    pub preset: SpeedPreset,
    pub profile: Profile,
    /// Constant quality factor, 0–51, lower is better. Takes precedence over
    /// `bitrate`; `null` selects bitrate mode.
    pub crf: Option<u8>,
    #[serde(alias = "hardwareAcceleration", alias = "useHardwareAccel")]
    pub hardware_acceleration: bool,
    /// 0 lets the encoder decide.
    #[serde(alias = "threadCount")]
    pub thread_count: u32,
    #[serde(alias = "maxBFrames")]
    pub max_b_frames: u32,
    /// Zero B-frames and zero-latency tuning where the encoder supports it.
    #[serde(alias = "lowLatency")]
    pub low_latency: bool,
    /// GStreamer element names tried before the platform candidate list.
    #[serde(alias = "encoderPriority")]
    pub encoder_priority: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 30,
            bitrate: 4_000_000,
            gop_size: 60,
            codec: VideoCodec::H264,
            preset: SpeedPreset::Fast,
            profile: Profile::Main,
            crf: Some(23),
            hardware_acceleration: true,
            thread_count: 0,
            max_b_frames: 2,
            low_latency: false,
            encoder_priority: Vec::new(),
        }
    }
}

impl EncoderConfig {
    pub const MAX_CRF: u8 = 51;

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Duration of one frame in nanoseconds.
    pub fn frame_duration_ns(&self) -> u64 {
        1_000_000_000 / self.framerate.max(1) as u64
    }

    /// B-frame depth actually requested from the encoder.
    pub fn effective_b_frames(&self) -> u32 {
        if self.low_latency { 0 } else { self.max_b_frames }
    }

    pub fn validate(&self) -> Result<(), EncoderError> {
        let invalid = |reason: String| Err(EncoderError::InvalidConfig { reason });
        if self.width == 0 || self.height == 0 {
            return invalid(format!("resolution {}x{} is empty", self.width, self.height));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return invalid(format!(
                "resolution {}x{} must be even for 4:2:0 encoding",
                self.width, self.height
            ));
        }
        if self.framerate == 0 {
            return invalid("framerate must be > 0".into());
        }
        if self.gop_size == 0 {
            return invalid("gop_size must be > 0".into());
        }
        if let Some(crf) = self.crf {
            if crf > Self::MAX_CRF {
                return invalid(format!("crf {crf} out of range 0-{}", Self::MAX_CRF));
            }
        } else if self.bitrate == 0 {
            return invalid("bitrate must be > 0 when crf is unset".into());
        }
        Ok(())
    }
}

// MARK: - SpeedPreset

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedPreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl SpeedPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ultrafast => "ultrafast",
            Self::Superfast => "superfast",
            Self::Veryfast => "veryfast",
            Self::Faster => "faster",
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
            Self::Slower => "slower",
            Self::Veryslow => "veryslow",
        }
    }

    /// 0 (fastest) to 8 (slowest).
    pub fn rank(&self) -> u32 {
        *self as u32
    }
}

// MARK: - Profile

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Baseline,
    Main,
    High,
}

impl Profile {
    /// Caps `profile` field value for the given codec, if it has one.
    pub fn caps_value(&self, codec: VideoCodec) -> Option<&'static str> {
        match (codec, self) {
            (VideoCodec::H264, Self::Baseline) => Some("constrained-baseline"),
            (VideoCodec::H264, Self::Main) => Some("main"),
            (VideoCodec::H264, Self::High) => Some("high"),
            (VideoCodec::H265, _) => Some("main"),
            (VideoCodec::Av1, _) => None,
        }
    }
}

// MARK: - CaptureSettings

/// Which capture backend variant to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Desktop duplication on Windows, screen session on Linux.
    #[default]
    Auto,
    DesktopDuplication,
    ScreenSession,
    Synthetic,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "auto" => Ok(Self::Auto),
            "desktop-duplication" | "dxgi" => Ok(Self::DesktopDuplication),
            "screen-session" | "pipewire" => Ok(Self::ScreenSession),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(format!("unknown capture backend '{other}'")),
        }
    }
}

/// Test-pattern source used by the synthetic backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Number of identical virtual displays reported by `monitors()`.
    pub monitors: usize,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self { width: 1280, height: 720, fps: 60, monitors: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    #[serde(alias = "monitorIndex")]
    pub monitor_index: usize,
    #[serde(alias = "targetFPS", alias = "targetFps")]
    pub target_fps: u32,
    #[serde(alias = "queueCapacity")]
    pub queue_capacity: usize,
    pub backend: BackendKind,
    #[serde(alias = "reinitializeOnAccessLost")]
    pub reinitialize_on_access_lost: bool,
    #[serde(alias = "errorBackoffMs")]
    pub error_backoff_ms: u64,
    pub synthetic: SyntheticSettings,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            monitor_index: 0,
            target_fps: 60,
            queue_capacity: 3,
            backend: BackendKind::Auto,
            reinitialize_on_access_lost: true,
            error_backoff_ms: 100,
            synthetic: SyntheticSettings::default(),
        }
    }
}

impl CaptureSettings {
    /// Backend poll timeout matching one frame interval at `target_fps`.
    pub fn poll_timeout_ms(&self) -> u32 {
        (1000 / self.target_fps.max(1)).max(1)
    }

    pub fn error_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.error_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EncoderConfig::default();
        assert_eq!((cfg.width, cfg.height, cfg.framerate), (1920, 1080, 30));
        assert_eq!(cfg.bitrate, 4_000_000);
        assert_eq!(cfg.gop_size, 60);
        assert_eq!(cfg.codec, VideoCodec::H264);
        assert_eq!(cfg.preset, SpeedPreset::Fast);
        assert_eq!(cfg.profile, Profile::Main);
        assert_eq!(cfg.crf, Some(23));
        assert!(cfg.hardware_acceleration);
        assert_eq!(cfg.thread_count, 0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "width": 1280,
            "height": 720,
            "frameRate": 60,
            "gopSize": 120,
            "codec": "hevc",
            "preset": "ultrafast",
            "crf": null,
            "useHardwareAccel": false,
            "threadCount": 4
        }"#;

        let cfg: EncoderConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.framerate, 60);
        assert_eq!(cfg.gop_size, 120);
        assert_eq!(cfg.codec, VideoCodec::H265);
        assert_eq!(cfg.crf, None);
        assert!(!cfg.hardware_acceleration);
        assert_eq!(cfg.thread_count, 4);
        assert_eq!(cfg.bitrate, 4_000_000);
    }

    #[test]
    fn deserializes_snake_case_capture_settings() {
        let json = r#"{ "monitor_index": 1, "target_fps": 30, "backend": "synthetic" }"#;
        let cfg: CaptureSettings = serde_json::from_str(json).expect("valid snake_case config");
        assert_eq!(cfg.monitor_index, 1);
        assert_eq!(cfg.poll_timeout_ms(), 33);
        assert_eq!(cfg.backend, BackendKind::Synthetic);
        assert_eq!(cfg.queue_capacity, 3);
    }

    #[test]
    fn validate_rejects_odd_resolution_and_crf_overflow() {
        let odd = EncoderConfig { width: 1921, ..Default::default() };
        assert!(matches!(odd.validate(), Err(EncoderError::InvalidConfig { .. })));

        let crf = EncoderConfig { crf: Some(52), ..Default::default() };
        assert!(crf.validate().is_err());

        let bitrate_only = EncoderConfig { crf: None, bitrate: 0, ..Default::default() };
        assert!(bitrate_only.validate().is_err());
    }

    #[test]
    fn low_latency_disables_b_frames() {
        let cfg = EncoderConfig { low_latency: true, max_b_frames: 3, ..Default::default() };
        assert_eq!(cfg.effective_b_frames(), 0);
    }

    #[test]
    fn backend_kind_parses_env_spellings() {
        assert_eq!("pipewire".parse::<BackendKind>(), Ok(BackendKind::ScreenSession));
        assert_eq!("desktop_duplication".parse::<BackendKind>(), Ok(BackendKind::DesktopDuplication));
        assert!("x11".parse::<BackendKind>().is_err());
    }
}
