//! PipeWire screen-session capture.
//!
//! ```text
//! ashpd portal ──► PipeWire node_id + remote fd
//!                          │
//!            pipewiresrc(fd=X, path=Y)
//!                          │
//!                    videoconvert
//!                          │
//!               video/x-raw,format=BGRx
//!                          │
//!                       appsink ──► try_pull_sample(timeout) ──► MappedFrame
//! ```
//!
//! Portal negotiation is async; it runs on a current-thread tokio runtime
//! owned by the backend so `initialize` stays a plain blocking call on the
//! capture thread.

use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd};

use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::{PersistMode, ResponseError};
use ashpd::WindowIdentifier;
use deskstream_core::clock::TimestampSource;
use deskstream_core::{CaptureError, MonitorInfo, PixelFormat, Resolution};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::{drm, MappedFrame, Pixels};

// ── ScreenSession ────────────────────────────────────────────────────

pub struct ScreenSession {
    runtime: Option<tokio::runtime::Runtime>,
    stream: Option<ActiveStream>,
    output: Option<usize>,
    resolution: Option<Resolution>,
    timestamps: TimestampSource,
    last_error: Option<CaptureError>,
}

struct ActiveStream {
    pipeline: gst::Pipeline,
    appsink: AppSink,
    bus: gst::Bus,
    // Closed after the pipeline reaches Null
    _remote: OwnedFd,
}

impl Default for ScreenSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenSession {
    pub fn new() -> Self {
        Self {
            runtime: None,
            stream: None,
            output: None,
            resolution: None,
            timestamps: TimestampSource::new(),
            last_error: None,
        }
    }

    pub fn initialize(&mut self, output_index: usize) -> Result<(), CaptureError> {
        if self.stream.is_some() && self.output == Some(output_index) {
            return Ok(());
        }
        self.teardown();
        let result = self.open(output_index);
        if let Err(e) = &result {
            self.last_error = Some(e.clone());
        }
        result
    }

    fn open(&mut self, output_index: usize) -> Result<(), CaptureError> {
        let monitors = drm::connected_monitors();
        if !monitors.is_empty() && output_index >= monitors.len() {
            return Err(CaptureError::OutputNotFound {
                index: output_index,
                available: monitors.len(),
            });
        }

        gst::init().map_err(|e| CaptureError::Device { reason: format!("GStreamer init: {e}") })?;

        if self.runtime.is_none() {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| CaptureError::Device { reason: format!("portal runtime: {e}") })?;
            self.runtime = Some(rt);
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(CaptureError::NotInitialized);
        };

        let grant = runtime.block_on(negotiate_portal(output_index))?;
        info!(
            "PipeWire portal ok: node_id={} fd={} (output={})",
            grant.node_id,
            grant.remote.as_raw_fd(),
            output_index
        );

        let stream = ActiveStream::start(grant.node_id, grant.remote)?;
        self.resolution = grant.size.or_else(|| monitors.get(output_index).map(|m| m.resolution()));
        self.stream = Some(stream);
        self.output = Some(output_index);
        self.last_error = None;
        Ok(())
    }

    pub fn capture_frame(
        &mut self,
        timeout_ms: u32,
    ) -> Result<Option<MappedFrame<'_>>, CaptureError> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(CaptureError::NotInitialized);
        };
        let (appsink, bus) = (stream.appsink.clone(), stream.bus.clone());

        if let Some(reason) = pending_failure(&bus) {
            warn!("PipeWire session ended: {}", reason);
            return Err(self.lose_access());
        }

        let timeout = gst::ClockTime::from_mseconds(timeout_ms as u64);
        let Some(sample) = appsink.try_pull_sample(timeout) else {
            if appsink.is_eos() {
                return Err(self.lose_access());
            }
            return Ok(None);
        };

        let info = sample
            .caps()
            .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
            .ok_or_else(|| self.fail("sample without raw video caps"))?;
        let buffer = sample
            .buffer_owned()
            .ok_or_else(|| self.fail("sample without buffer"))?;
        let map = buffer
            .into_mapped_buffer_readable()
            .map_err(|_| self.fail("buffer not readable"))?;

        let resolution = Resolution::new(info.width(), info.height());
        if self.resolution != Some(resolution) {
            debug!("PipeWire stream negotiated {}", resolution);
            self.resolution = Some(resolution);
        }
        let stride = info.stride()[0].max(0) as u32;
        let timestamp_us = self.timestamps.next();

        Ok(Some(MappedFrame::new(
            resolution,
            stride,
            PixelFormat::Bgra8,
            timestamp_us,
            Pixels::Session(SessionMapping { map, _backend: PhantomData }),
        )))
    }

    pub fn shutdown(&mut self) {
        self.teardown();
        self.runtime = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.stream.is_some()
    }

    pub fn native_resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }

    pub fn monitors(&self) -> Vec<MonitorInfo> {
        drm::connected_monitors()
    }

    fn lose_access(&mut self) -> CaptureError {
        self.teardown();
        self.last_error = Some(CaptureError::AccessLost);
        CaptureError::AccessLost
    }

    fn fail(&mut self, reason: &str) -> CaptureError {
        let err = CaptureError::Failed { reason: reason.to_string() };
        self.last_error = Some(err.clone());
        err
    }

    fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pipeline.set_state(gst::State::Null);
            debug!("PipeWire pipeline stopped");
        }
        self.output = None;
    }
}

impl Drop for ScreenSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ── Portal negotiation ───────────────────────────────────────────────

struct PortalGrant {
    node_id: u32,
    remote: OwnedFd,
    size: Option<Resolution>,
}

/// Ask the XDG desktop portal for a PipeWire screen-cast stream.
async fn negotiate_portal(output_index: usize) -> Result<PortalGrant, CaptureError> {
    let proxy = Screencast::new().await.map_err(portal_error)?;
    let session = proxy.create_session().await.map_err(portal_error)?;

    proxy
        .select_sources(
            &session,
            CursorMode::Embedded,
            SourceType::Monitor.into(),
            output_index > 0, // multiple
            None,
            PersistMode::DoNot,
        )
        .await
        .map_err(portal_error)?;

    let response = proxy
        .start(&session, &WindowIdentifier::default())
        .await
        .map_err(portal_error)?
        .response()
        .map_err(portal_error)?;

    let streams = response.streams();
    if streams.is_empty() {
        return Err(CaptureError::Unavailable { reason: "portal returned no streams".into() });
    }
    let stream = match streams.get(output_index) {
        Some(s) => s,
        None => {
            warn!(
                "Portal shared {} stream(s), output {} not among them; using the first",
                streams.len(),
                output_index
            );
            &streams[0]
        }
    };
    let node_id = stream.pipe_wire_node_id();
    let size = stream
        .size()
        .filter(|(w, h)| *w > 0 && *h > 0)
        .map(|(w, h)| Resolution::new(w as u32, h as u32));

    let remote = proxy.open_pipe_wire_remote(&session).await.map_err(portal_error)?;
    Ok(PortalGrant { node_id, remote, size })
}

fn portal_error(e: ashpd::Error) -> CaptureError {
    match e {
        ashpd::Error::Response(ResponseError::Cancelled) => {
            CaptureError::AccessDenied { reason: "screen share request was cancelled".into() }
        }
        other => CaptureError::Unavailable { reason: format!("ScreenCast portal: {other}") },
    }
}

// ── GStreamer pipeline ───────────────────────────────────────────────

impl ActiveStream {
    fn start(node_id: u32, remote: OwnedFd) -> Result<Self, CaptureError> {
        let device = |reason: String| CaptureError::Device { reason };
        let fd = remote.as_raw_fd();
        let desc = format!(
            "pipewiresrc fd={fd} path={node_id} do-timestamp=true \
             ! videoconvert \
             ! video/x-raw,format=BGRx \
             ! appsink name=sink max-buffers=2 drop=true sync=false emit-signals=false"
        );
        debug!("GStreamer pipeline: {}", desc);

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| device(format!("parse pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| device("expected a pipeline".into()))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<AppSink>().ok())
            .ok_or_else(|| device("appsink 'sink' missing".into()))?;
        let bus = pipeline.bus().ok_or_else(|| device("pipeline has no bus".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| device(format!("set Playing: {e}")))?;

        Ok(Self { pipeline, appsink, bus, _remote: remote })
    }
}

/// Error or EOS posted on the bus since the last poll.
fn pending_failure(bus: &gst::Bus) -> Option<String> {
    let msg = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])?;
    Some(match msg.view() {
        gst::MessageView::Error(e) => e.error().to_string(),
        _ => "end of stream".to_string(),
    })
}

// ── SessionMapping ───────────────────────────────────────────────────

/// Readable mapping of one appsink buffer; unmapped when dropped.
pub(crate) struct SessionMapping<'a> {
    map: gst::MappedBuffer<gst::buffer::Readable>,
    _backend: PhantomData<&'a mut ScreenSession>,
}

impl SessionMapping<'_> {
    pub(crate) fn as_slice(&self) -> &[u8] {
        self.map.as_slice()
    }
}
