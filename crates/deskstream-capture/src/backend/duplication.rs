//! DXGI Desktop Duplication capture.
//!
//! Requires Windows 8+ and a D3D11-capable adapter (WARP is used when no
//! hardware device can be created).
//!
//! # Per-frame flow
//!
//! `AcquireNextFrame` → copy the desktop texture into a CPU-readable staging
//! texture → `Map` → hand out a [`MappedFrame`]. The mapping guard unmaps the
//! staging texture and calls `ReleaseFrame` when dropped; the duplication
//! interface refuses a new acquire until the previous frame is released.

use std::marker::PhantomData;

use deskstream_core::clock::TimestampSource;
use deskstream_core::{CaptureError, MonitorInfo, PixelFormat, Resolution};
use tracing::{debug, info, warn};
use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::{BOOL, E_ACCESSDENIED, HMODULE, LPARAM, RECT};
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE,
    D3D11_MAP_READ, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter, IDXGIDevice, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_NOT_CURRENTLY_AVAILABLE, DXGI_ERROR_NOT_FOUND,
    DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO,
};
use windows::Win32::Graphics::Gdi::{
    EnumDisplayMonitors, EnumDisplaySettingsW, GetMonitorInfoW, DEVMODEW, ENUM_CURRENT_SETTINGS,
    HDC, HMONITOR, MONITORINFO, MONITORINFOEXW,
};

use super::{MappedFrame, Pixels};

const MONITORINFOF_PRIMARY: u32 = 0x1;

// ── DesktopDuplication ───────────────────────────────────────────────

#[derive(Default)]
pub struct DesktopDuplication {
    output: Option<DuplicatedOutput>,
    timestamps: TimestampSource,
    last_error: Option<CaptureError>,
}

struct DuplicatedOutput {
    index: usize,
    resolution: Resolution,
    _device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    staging: ID3D11Texture2D,
}

// SAFETY: the device, context and duplication are created on one thread and
// moved whole to the capture thread; they are never used from two threads at
// once.
unsafe impl Send for DuplicatedOutput {}

impl DesktopDuplication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, output_index: usize) -> Result<(), CaptureError> {
        if self.output.as_ref().map(|o| o.index) == Some(output_index) {
            return Ok(());
        }
        self.output = None;
        match open_output(output_index) {
            Ok(output) => {
                info!(
                    "Output {} duplicated at {}",
                    output_index, output.resolution
                );
                self.output = Some(output);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    pub fn capture_frame(
        &mut self,
        timeout_ms: u32,
    ) -> Result<Option<MappedFrame<'_>>, CaptureError> {
        let Some(output) = self.output.as_ref() else {
            return Err(CaptureError::NotInitialized);
        };
        let duplication = output.duplication.clone();
        let context = output.context.clone();
        let staging = output.staging.clone();
        let resolution = output.resolution;

        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let acquired =
            unsafe { duplication.AcquireNextFrame(timeout_ms, &mut frame_info, &mut resource) };
        if let Err(e) = acquired {
            let code = e.code();
            if code == DXGI_ERROR_WAIT_TIMEOUT {
                return Ok(None);
            }
            if code == DXGI_ERROR_ACCESS_LOST {
                warn!("Desktop duplication access lost (mode change, UAC or lock screen)");
                self.output = None;
                self.last_error = Some(CaptureError::AccessLost);
                return Err(CaptureError::AccessLost);
            }
            return Err(self.fail(format!("AcquireNextFrame: {e}")));
        }

        // From here on the guard owns the acquired frame
        let mut mapping = DuplicationMapping {
            duplication,
            context: context.clone(),
            mapped: None,
            data: std::ptr::null(),
            len: 0,
            _backend: PhantomData,
        };

        // Pointer-only update
        if frame_info.AccumulatedFrames == 0 {
            return Ok(None);
        }

        let Some(resource) = resource else {
            return Err(self.fail("AcquireNextFrame returned no desktop resource".into()));
        };
        let texture: ID3D11Texture2D = resource
            .cast()
            .map_err(|e| self.fail(format!("cast ID3D11Texture2D: {e}")))?;

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            context.CopyResource(&staging, &texture);
            context.Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
        }
        .map_err(|e| self.fail(format!("Map staging texture: {e}")))?;

        mapping.mapped = Some(staging);
        mapping.data = mapped.pData as *const u8;
        mapping.len = mapped.RowPitch as usize * resolution.height as usize;

        let timestamp_us = self.timestamps.next();
        Ok(Some(MappedFrame::new(
            resolution,
            mapped.RowPitch,
            PixelFormat::Bgra8,
            timestamp_us,
            Pixels::Duplication(mapping),
        )))
    }

    pub fn shutdown(&mut self) {
        if self.output.take().is_some() {
            debug!("Desktop duplication released");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.output.is_some()
    }

    pub fn native_resolution(&self) -> Option<Resolution> {
        self.output.as_ref().map(|o| o.resolution)
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }

    pub fn monitors(&self) -> Vec<MonitorInfo> {
        enumerate_monitors()
    }

    fn fail(&mut self, reason: String) -> CaptureError {
        let err = CaptureError::Failed { reason };
        self.last_error = Some(err.clone());
        err
    }
}

// ── Setup ────────────────────────────────────────────────────────────

fn open_output(index: usize) -> Result<DuplicatedOutput, CaptureError> {
    let device_err = |what: &str, e: windows::core::Error| CaptureError::Device {
        reason: format!("{what}: {e}"),
    };

    let (device, context) = create_device()?;
    let dxgi_device: IDXGIDevice = device.cast().map_err(|e| device_err("cast IDXGIDevice", e))?;
    let adapter = unsafe { dxgi_device.GetAdapter() }.map_err(|e| device_err("GetAdapter", e))?;

    let output = match unsafe { adapter.EnumOutputs(index as u32) } {
        Ok(output) => output,
        Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => {
            return Err(CaptureError::OutputNotFound { index, available: count_outputs(&adapter) });
        }
        Err(e) => return Err(device_err("EnumOutputs", e)),
    };

    let desc = unsafe { output.GetDesc() }.map_err(|e| device_err("IDXGIOutput::GetDesc", e))?;
    let rect = desc.DesktopCoordinates;
    let resolution = Resolution::new(
        (rect.right - rect.left).max(0) as u32,
        (rect.bottom - rect.top).max(0) as u32,
    );

    let output1: IDXGIOutput1 = output.cast().map_err(|e| device_err("cast IDXGIOutput1", e))?;
    let duplication = unsafe { output1.DuplicateOutput(&device) }.map_err(|e| {
        let code = e.code();
        if code == DXGI_ERROR_NOT_CURRENTLY_AVAILABLE {
            CaptureError::Unavailable { reason: "output is already duplicated by another process".into() }
        } else if code == E_ACCESSDENIED {
            CaptureError::AccessDenied { reason: "DuplicateOutput denied (secure desktop?)".into() }
        } else {
            device_err("DuplicateOutput", e)
        }
    })?;

    let staging = create_staging_texture(&device, resolution.width, resolution.height)?;

    Ok(DuplicatedOutput { index, resolution, _device: device, context, duplication, staging })
}

/// Hardware device first, WARP as fallback.
fn create_device() -> Result<(ID3D11Device, ID3D11DeviceContext), CaptureError> {
    let mut last = None;
    for driver in [D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP] {
        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        let created = unsafe {
            D3D11CreateDevice(
                None::<&IDXGIAdapter>,
                driver,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        };
        match (created, device, context) {
            (Ok(()), Some(device), Some(context)) => {
                debug!("D3D11 device created ({:?})", driver);
                return Ok((device, context));
            }
            (Err(e), _, _) => {
                debug!("D3D11CreateDevice({:?}) failed: {}", driver, e);
                last = Some(e.to_string());
            }
            _ => last = Some("D3D11CreateDevice returned no device".into()),
        }
    }
    Err(CaptureError::Device {
        reason: last.unwrap_or_else(|| "no D3D11 driver available".into()),
    })
}

fn count_outputs(adapter: &IDXGIAdapter) -> usize {
    (0u32..).take_while(|&i| unsafe { adapter.EnumOutputs(i) }.is_ok()).count()
}

/// CPU-readable staging texture matching (w×h, BGRA8).
fn create_staging_texture(
    device: &ID3D11Device,
    w: u32,
    h: u32,
) -> Result<ID3D11Texture2D, CaptureError> {
    let desc = D3D11_TEXTURE2D_DESC {
        Width: w,
        Height: h,
        MipLevels: 1,
        ArraySize: 1,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Usage: D3D11_USAGE_STAGING,
        BindFlags: 0,
        CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
        MiscFlags: 0,
    };
    let mut tex: Option<ID3D11Texture2D> = None;
    unsafe { device.CreateTexture2D(&desc, None, Some(&mut tex)) }
        .map_err(|e| CaptureError::Device { reason: format!("CreateTexture2D staging: {e}") })?;
    tex.ok_or_else(|| CaptureError::Device { reason: "CreateTexture2D returned nothing".into() })
}

// ── Monitor enumeration ──────────────────────────────────────────────

/// Connected monitors, in the order Windows reports them.
fn enumerate_monitors() -> Vec<MonitorInfo> {
    let mut handles: Vec<HMONITOR> = Vec::new();

    unsafe extern "system" fn collect(hmon: HMONITOR, _: HDC, _: *mut RECT, data: LPARAM) -> BOOL {
        let list = data.0 as *mut Vec<HMONITOR>;
        unsafe { (*list).push(hmon) };
        BOOL(1)
    }

    unsafe {
        let _ = EnumDisplayMonitors(
            HDC::default(),
            None,
            Some(collect),
            LPARAM(&mut handles as *mut _ as isize),
        );
    }

    handles
        .into_iter()
        .enumerate()
        .filter_map(|(i, hmon)| describe_monitor(i as u32, hmon))
        .collect()
}

fn describe_monitor(id: u32, hmon: HMONITOR) -> Option<MonitorInfo> {
    let mut info = MONITORINFOEXW::default();
    info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;
    let ok = unsafe { GetMonitorInfoW(hmon, &mut info.monitorInfo as *mut MONITORINFO) };
    if !ok.as_bool() {
        return None;
    }

    let rect = info.monitorInfo.rcMonitor;
    let device_len = info.szDevice.iter().position(|&c| c == 0).unwrap_or(info.szDevice.len());
    let name = String::from_utf16_lossy(&info.szDevice[..device_len]);

    let mut mode = DEVMODEW {
        dmSize: std::mem::size_of::<DEVMODEW>() as u16,
        ..Default::default()
    };
    let refresh_rate = unsafe {
        EnumDisplaySettingsW(PCWSTR(info.szDevice.as_ptr()), ENUM_CURRENT_SETTINGS, &mut mode)
    }
    .as_bool()
    .then_some(mode.dmDisplayFrequency as f32)
    .unwrap_or(0.0);

    Some(MonitorInfo {
        id,
        name,
        width: (rect.right - rect.left).max(0) as u32,
        height: (rect.bottom - rect.top).max(0) as u32,
        x: rect.left,
        y: rect.top,
        refresh_rate,
        is_primary: info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY != 0,
    })
}

// ── DuplicationMapping ───────────────────────────────────────────────

/// One acquired desktop frame, mapped through the staging texture.
pub(crate) struct DuplicationMapping<'a> {
    duplication: IDXGIOutputDuplication,
    context: ID3D11DeviceContext,
    mapped: Option<ID3D11Texture2D>,
    data: *const u8,
    len: usize,
    _backend: PhantomData<&'a mut DesktopDuplication>,
}

impl DuplicationMapping<'_> {
    pub(crate) fn as_slice(&self) -> &[u8] {
        if self.data.is_null() {
            return &[];
        }
        // Valid until Unmap in drop
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

impl Drop for DuplicationMapping<'_> {
    fn drop(&mut self) {
        unsafe {
            if let Some(staging) = self.mapped.take() {
                self.context.Unmap(&staging, 0);
            }
            let _ = self.duplication.ReleaseFrame();
        }
    }
}
