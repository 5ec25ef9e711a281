use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

use super::ContainerSink;
use crate::error::{AppError, Result};
use crate::video::packet::Packet;

/// Annex-B elementary stream written as-is (`.h264` / `.h265`)
pub struct RawSink<W: Write + Send + 'static> {
    out: W,
    bytes: u64,
}

impl RawSink<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            AppError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create {}: {}", path.display(), e),
            ))
        })?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send + 'static> RawSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, bytes: 0 }
    }
}

impl<W: Write + Send + 'static> ContainerSink for RawSink<W> {
    fn write_video(&mut self, packet: &Packet) -> Result<()> {
        self.out.write_all(packet.data())?;
        self.bytes += packet.len() as u64;
        Ok(())
    }

    fn write_audio(&mut self, _packet: &Packet) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        debug!("Raw stream finished, {} bytes", self.bytes);
        Ok(())
    }
}
