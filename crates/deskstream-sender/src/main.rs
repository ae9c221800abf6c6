//! deskstream sender: capture one monitor, encode it, hand packets to a sink.
//!
//! ```text
//! CaptureEngine ──► VideoEncoder ──► AnnexBFileSink (--output) | DiscardSink
//!  (thread + drop-oldest queue)        (streaming server plugs in here)
//! ```
//!
//! Configuration layers, later wins: `--config` JSON file, `DESKSTREAM_*`
//! environment variables, command-line flags.

mod pipeline;
mod settings;
mod sink;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use deskstream_capture::CaptureEngine;
use deskstream_core::{BackendKind, VideoCodec};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::pipeline::{Pipeline, PipelineStatus};
use crate::settings::SenderConfig;
use crate::sink::{AnnexBFileSink, DiscardSink};

#[derive(Parser, Debug)]
#[command(name = "deskstream-sender", version)]
#[command(about = "Capture the desktop and encode it to H.264 / H.265 / AV1", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
    /// Print the monitors the capture backend sees, as JSON, and exit
    #[arg(long)]
    list_monitors: bool,
    /// auto, desktop-duplication, screen-session or synthetic
    #[arg(short, long)]
    backend: Option<BackendKind>,
    #[arg(short, long)]
    monitor: Option<usize>,
    #[arg(long)]
    codec: Option<VideoCodec>,
    /// Write the elementary stream here instead of discarding it
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long)]
    max_frames: Option<u64>,
    /// Skip hardware encoders
    #[arg(long)]
    software: bool,
}

impl Cli {
    fn apply(&self, config: &mut SenderConfig) {
        if let Some(backend) = self.backend {
            config.capture.backend = backend;
        }
        if let Some(monitor) = self.monitor {
            config.capture.monitor_index = monitor;
        }
        if let Some(codec) = self.codec {
            config.encoder.codec = codec;
        }
        if let Some(output) = &self.output {
            config.output = Some(output.clone());
        }
        if self.max_frames.is_some() {
            config.max_frames = self.max_frames;
        }
        if self.software {
            config.encoder.hardware_acceleration = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" })),
        )
        .with_target(true)
        .init();

    info!("deskstream sender v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SenderConfig::load(cli.config.as_deref())?;
    config.apply_env()?;
    cli.apply(&mut config);

    if cli.list_monitors {
        let engine = CaptureEngine::new(config.capture.clone()).context("Creating capture backend")?;
        println!("{}", serde_json::to_string_pretty(&engine.available_monitors())?);
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut worker = {
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || run(config, &stop))
    };

    let status = tokio::select! {
        joined = &mut worker => joined.context("Pipeline thread panicked")??,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Ctrl-C handler unavailable: {}", e);
            }
            info!("Stopping…");
            stop.store(true, Ordering::Relaxed);
            worker.await.context("Pipeline thread panicked")??
        }
    };

    info!(
        "Done: {} frames encoded ({} skipped), {} packets, {} bytes, {} frames dropped by capture",
        status.frames_in,
        status.encode_errors,
        status.packets_out,
        status.bytes_out,
        status.capture.frames_dropped
    );
    Ok(())
}

/// Build the engine and sink on the pipeline thread and run to completion.
fn run(config: SenderConfig, stop: &AtomicBool) -> Result<PipelineStatus> {
    let engine = CaptureEngine::new(config.capture.clone()).context("Creating capture backend")?;
    match config.output.clone() {
        Some(path) => {
            let mut sink = AnnexBFileSink::create(&path)?;
            info!("Writing {} stream to {}", config.encoder.codec, path.display());
            let status = Pipeline::new(config, engine, &mut sink).run(stop)?;
            info!("{} bytes written to {}", sink.bytes_written(), path.display());
            Ok(status)
        }
        None => {
            let mut sink = DiscardSink::default();
            let status = Pipeline::new(config, engine, &mut sink).run(stop)?;
            debug!(
                "Discarded {} packets ({} keyframes, {} bytes)",
                sink.packets, sink.keyframes, sink.bytes
            );
            Ok(status)
        }
    }
}
