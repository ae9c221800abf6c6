//! Generated test source.
//!
//! Renders a moving BGRA gradient into a buffer whose rows are padded to 256
//! bytes, paced to `SyntheticSettings::fps`. A [`SyntheticControl`] handle
//! injects the failures a real capture service produces (revoked access,
//! transient errors, denied initialization) plus panics, so the engine's
//! recovery paths can be driven without an OS capture service.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use deskstream_core::clock::TimestampSource;
use deskstream_core::{CaptureError, MonitorInfo, PixelFormat, Resolution, SyntheticSettings};
use tracing::{debug, info};

use super::{MappedFrame, Pixels};

const ROW_ALIGN: usize = 256;

// MARK: - SyntheticControl

/// Shared fault-injection and observation handle.
#[derive(Debug, Default)]
pub struct SyntheticControl {
    lose_access: AtomicBool,
    panic_next: AtomicBool,
    deny_initialize: AtomicBool,
    fail_next: Mutex<Option<String>>,
    initializations: AtomicU64,
    mappings_acquired: AtomicU64,
    mappings_released: AtomicU64,
}

impl SyntheticControl {
    /// Next capture returns `AccessLost` and drops the binding.
    pub fn lose_access(&self) {
        self.lose_access.store(true, Ordering::SeqCst);
    }

    /// Next capture returns `CaptureError::Failed { reason }`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason.into());
    }

    /// Next capture panics.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// While set, `initialize` fails with `AccessDenied`.
    pub fn deny_initialize(&self, deny: bool) {
        self.deny_initialize.store(deny, Ordering::SeqCst);
    }

    /// Successful `initialize` calls that bound an output.
    pub fn initializations(&self) -> u64 {
        self.initializations.load(Ordering::SeqCst)
    }

    pub fn mappings_acquired(&self) -> u64 {
        self.mappings_acquired.load(Ordering::SeqCst)
    }

    pub fn mappings_released(&self) -> u64 {
        self.mappings_released.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Option<String> {
        self.fail_next.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

// MARK: - SyntheticSource

pub struct SyntheticSource {
    settings: SyntheticSettings,
    control: Arc<SyntheticControl>,
    output: Option<usize>,
    stride: u32,
    buffer: Vec<u8>,
    frame_index: u64,
    next_due: Option<Instant>,
    timestamps: TimestampSource,
    last_error: Option<CaptureError>,
}

impl SyntheticSource {
    pub fn new(settings: SyntheticSettings) -> Self {
        let stride = padded_stride(settings.width);
        Self {
            settings,
            control: Arc::new(SyntheticControl::default()),
            output: None,
            stride,
            buffer: Vec::new(),
            frame_index: 0,
            next_due: None,
            timestamps: TimestampSource::new(),
            last_error: None,
        }
    }

    /// Handle for injecting faults after the source has moved to another thread.
    pub fn control(&self) -> Arc<SyntheticControl> {
        Arc::clone(&self.control)
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn initialize(&mut self, output_index: usize) -> Result<(), CaptureError> {
        if self.output == Some(output_index) {
            return Ok(());
        }
        if self.control.deny_initialize.load(Ordering::SeqCst) {
            let err = CaptureError::AccessDenied { reason: "synthetic source denied".into() };
            self.last_error = Some(err.clone());
            return Err(err);
        }
        let available = self.settings.monitors;
        if output_index >= available {
            let err = CaptureError::OutputNotFound { index: output_index, available };
            self.last_error = Some(err.clone());
            return Err(err);
        }
        if self.settings.width == 0 || self.settings.height == 0 {
            let err = CaptureError::Device {
                reason: format!(
                    "synthetic resolution {}x{} is empty",
                    self.settings.width, self.settings.height
                ),
            };
            self.last_error = Some(err.clone());
            return Err(err);
        }

        self.buffer = vec![0; self.stride as usize * self.settings.height as usize];
        self.output = Some(output_index);
        self.next_due = None;
        self.last_error = None;
        self.control.initializations.fetch_add(1, Ordering::SeqCst);
        info!(
            "Synthetic output {} bound: {}x{} stride={} @ {} fps",
            output_index, self.settings.width, self.settings.height, self.stride, self.settings.fps
        );
        Ok(())
    }

    pub fn capture_frame(
        &mut self,
        timeout_ms: u32,
    ) -> Result<Option<MappedFrame<'_>>, CaptureError> {
        if self.output.is_none() {
            return Err(CaptureError::NotInitialized);
        }
        if self.control.panic_next.swap(false, Ordering::SeqCst) {
            panic!("injected synthetic capture panic");
        }
        if self.control.lose_access.swap(false, Ordering::SeqCst) {
            debug!("Synthetic access lost");
            self.release_output();
            self.last_error = Some(CaptureError::AccessLost);
            return Err(CaptureError::AccessLost);
        }
        if let Some(reason) = self.control.take_failure() {
            let err = CaptureError::Failed { reason };
            self.last_error = Some(err.clone());
            return Err(err);
        }

        // Pace to the configured rate
        let interval = Duration::from_secs(1) / self.settings.fps.max(1);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            let wait = due - now;
            let timeout = Duration::from_millis(timeout_ms as u64);
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }
        let after = Instant::now();
        self.next_due = Some(if after > due + interval { after + interval } else { due + interval });

        self.render();
        self.frame_index += 1;
        let timestamp_us = self.timestamps.next();

        self.control.mappings_acquired.fetch_add(1, Ordering::SeqCst);
        let resolution = Resolution::new(self.settings.width, self.settings.height);
        Ok(Some(MappedFrame::new(
            resolution,
            self.stride,
            PixelFormat::Bgra8,
            timestamp_us,
            Pixels::Synthetic(SyntheticMapping { bytes: &self.buffer, control: &self.control }),
        )))
    }

    pub fn shutdown(&mut self) {
        if self.output.is_some() {
            debug!("Synthetic source shut down");
        }
        self.release_output();
    }

    pub fn is_initialized(&self) -> bool {
        self.output.is_some()
    }

    pub fn native_resolution(&self) -> Option<Resolution> {
        self.output
            .map(|_| Resolution::new(self.settings.width, self.settings.height))
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }

    pub fn monitors(&self) -> Vec<MonitorInfo> {
        (0..self.settings.monitors)
            .map(|i| MonitorInfo {
                id: i as u32,
                name: format!("Synthetic-{i}"),
                width: self.settings.width,
                height: self.settings.height,
                x: (i as u32 * self.settings.width) as i32,
                y: 0,
                refresh_rate: self.settings.fps as f32,
                is_primary: i == 0,
            })
            .collect()
    }

    fn release_output(&mut self) {
        self.output = None;
        self.next_due = None;
        self.buffer = Vec::new();
    }

    /// Moving BGRA gradient. Row padding stays zero.
    fn render(&mut self) {
        let width = self.settings.width as usize;
        let stride = self.stride as usize;
        let shift = self.frame_index as usize;
        for (y, row) in self.buffer.chunks_exact_mut(stride).enumerate() {
            for (x, px) in row[..width * 4].chunks_exact_mut(4).enumerate() {
                px[0] = (x + shift) as u8;
                px[1] = (y + shift) as u8;
                px[2] = shift as u8;
                px[3] = 0xFF;
            }
        }
    }
}

fn padded_stride(width: u32) -> u32 {
    let row = width as usize * 4;
    (row.div_ceil(ROW_ALIGN) * ROW_ALIGN) as u32
}

// MARK: - SyntheticMapping

pub(crate) struct SyntheticMapping<'a> {
    bytes: &'a [u8],
    control: &'a SyntheticControl,
}

impl SyntheticMapping<'_> {
    pub(crate) fn as_slice(&self) -> &[u8] {
        self.bytes
    }
}

impl Drop for SyntheticMapping<'_> {
    fn drop(&mut self) {
        self.control.mappings_released.fetch_add(1, Ordering::SeqCst);
    }
}
