use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame dimensions must be non-zero (got {width}x{height})")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("Stride {stride} is shorter than one packed row ({min} bytes)")]
    StrideTooSmall { stride: u32, min: usize },

    #[error("Frame buffer holds {actual} bytes, expected stride*height = {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture backend not initialized")]
    NotInitialized,

    #[error("Display output {index} not found ({available} detected)")]
    OutputNotFound { index: usize, available: usize },

    #[error("Screen duplication unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Access denied: {reason}")]
    AccessDenied { reason: String },

    #[error("Capture access lost, reinitialize required")]
    AccessLost,

    #[error("Capture device creation failed: {reason}")]
    Device { reason: String },

    #[error("Capture failed: {reason}")]
    Failed { reason: String },

    #[error("Cannot change capture target while capturing")]
    Busy,

    #[error("Capture backend '{backend}' is not supported on this platform")]
    Unsupported { backend: String },

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),
}

impl CaptureError {
    /// Session revoked by the OS; the backend needs `shutdown` + `initialize`.
    pub fn is_access_lost(&self) -> bool {
        matches!(self, Self::AccessLost)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("Encoder not initialized")]
    NotInitialized,

    #[error("Encoder configuration invalid: {reason}")]
    InvalidConfig { reason: String },

    #[error("No encoder available for codec {codec}")]
    NoEncoder { codec: String },

    #[error("Failed to open codec {element}: {reason}")]
    CodecOpen { element: String, reason: String },

    #[error("Failed to build pixel converter: {reason}")]
    Converter { reason: String },

    #[error("Frame conversion wrote {written} of {expected} rows")]
    Conversion { written: u32, expected: u32 },

    #[error("Failed to submit frame to encoder: {reason}")]
    Submit { reason: String },

    #[error("Encoder pipeline error: {0}")]
    Pipeline(String),
}
