//! Where encoded packets go once they leave the encoder.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deskstream_core::EncodedPacket;
use tracing::debug;

/// Consumer of encoded packets. A streaming server plugs in here.
pub trait PacketSink {
    fn send(&mut self, packet: &EncodedPacket) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes packets back to back into a raw elementary stream file. Packets are
/// already Annex B for H.264 / H.265, so the file plays with `ffplay`.
pub struct AnnexBFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
}

impl AnnexBFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Creating {}", path.display()))?;
        Ok(Self { path: path.to_path_buf(), writer: BufWriter::new(file), bytes: 0 })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

impl PacketSink for AnnexBFileSink {
    fn send(&mut self, packet: &EncodedPacket) -> Result<()> {
        self.writer
            .write_all(&packet.data)
            .with_context(|| format!("Writing to {}", self.path.display()))?;
        self.bytes += packet.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().with_context(|| format!("Flushing {}", self.path.display()))?;
        debug!("{} bytes written to {}", self.bytes, self.path.display());
        Ok(())
    }
}

/// Counts packets and drops them.
#[derive(Debug, Default)]
pub struct DiscardSink {
    pub packets: u64,
    pub bytes: u64,
    pub keyframes: u64,
}

impl PacketSink for DiscardSink {
    fn send(&mut self, packet: &EncodedPacket) -> Result<()> {
        self.packets += 1;
        self.bytes += packet.len() as u64;
        if packet.is_keyframe {
            self.keyframes += 1;
        }
        Ok(())
    }
}
