//! Sender configuration: JSON file, then environment, then CLI flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deskstream_core::{BackendKind, CaptureSettings, EncoderConfig};
use serde::{Deserialize, Serialize};

pub const ENV_MONITOR: &str = "DESKSTREAM_MONITOR";
pub const ENV_BACKEND: &str = "DESKSTREAM_BACKEND";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub capture: CaptureSettings,
    pub encoder: EncoderConfig,
    /// Annex B output file. Packets are discarded when unset.
    pub output: Option<PathBuf>,
    /// Stop after this many frames have been encoded.
    #[serde(alias = "maxFrames")]
    pub max_frames: Option<u64>,
    /// Encode at the captured monitor's size instead of `encoder.width/height`.
    #[serde(alias = "matchCapture")]
    pub match_capture: bool,
    /// Seconds between stats log lines; 0 disables them.
    #[serde(alias = "statsIntervalSecs")]
    pub stats_interval_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            encoder: EncoderConfig::default(),
            output: None,
            max_frames: None,
            match_capture: true,
            stats_interval_secs: 5,
        }
    }
}

impl SenderConfig {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Parsing config {}", path.display()))
    }

    /// Apply `DESKSTREAM_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(monitor) = var(ENV_MONITOR) {
            self.capture.monitor_index = monitor
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MONITOR}={monitor} is not a monitor index"))?;
        }
        if let Some(backend) = var(ENV_BACKEND) {
            self.capture.backend = backend
                .parse::<BackendKind>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("{ENV_BACKEND}={backend}"))?;
        }
        Ok(())
    }
}
