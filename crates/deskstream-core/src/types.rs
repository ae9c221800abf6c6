use serde::{Deserialize, Serialize};

// MARK: - Resolution

/// Pixel dimensions of a display or an encode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self { width: 1280, height: 720 };
    pub const FHD: Self = Self { width: 1920, height: 1080 };
    pub const QHD: Self = Self { width: 2560, height: 1440 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - VideoCodec

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    #[serde(alias = "hevc")]
    H265,
    Av1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Av1 => "av1",
        }
    }

    /// GStreamer caps media type of the compressed stream.
    pub fn caps_name(&self) -> &'static str {
        match self {
            Self::H264 => "video/x-h264",
            Self::H265 => "video/x-h265",
            Self::Av1 => "video/x-av1",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Self::H264),
            "h265" | "hevc" => Ok(Self::H265),
            "av1" => Ok(Self::Av1),
            other => Err(format!("unknown codec '{other}' (expected h264, h265 or av1)")),
        }
    }
}

// MARK: - MonitorInfo

/// One attached display, as reported by static enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub id: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
    /// Refresh rate in Hz; `0.0` when the platform does not report it.
    pub refresh_rate: f32,
    pub is_primary: bool,
}

impl MonitorInfo {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

// MARK: - EncodedPacket

/// One compressed access unit produced by the encoder.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: bytes::Bytes,
    /// Presentation index in frames, counted from 0 at encoder start.
    pub pts: u64,
    pub is_keyframe: bool,
    pub codec: VideoCodec,
}

impl EncodedPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_parses_aliases() {
        assert_eq!("HEVC".parse::<VideoCodec>(), Ok(VideoCodec::H265));
        assert_eq!("avc".parse::<VideoCodec>(), Ok(VideoCodec::H264));
        assert!("vp9".parse::<VideoCodec>().is_err());
    }

    #[test]
    fn monitor_info_serializes_for_listing() {
        let info = MonitorInfo {
            id: 0,
            name: "DP-1".into(),
            width: 2560,
            height: 1440,
            x: 0,
            y: 0,
            refresh_rate: 144.0,
            is_primary: true,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"is_primary\":true"));
        assert_eq!(info.resolution(), Resolution::QHD);
    }
}
