//! PCM sinks.
//!
//! The dispatch loop hands every converted buffer to a [`PcmSink`] exactly once.
//! What the sink does with it (play it, store it, count it) is its own business.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

use crate::config::OutputFormat;
use crate::lock;

/// Consumer of raw PCM bytes in the player's output format.
pub trait PcmSink: Send + Sync {
    /// Accept `pcm` and return how many bytes were taken.
    fn write(&self, pcm: &[u8]) -> usize;
}

/// Discards PCM, keeping running totals for logging.
#[derive(Debug)]
pub struct NullSink {
    byte_rate: u64,
    total_bytes: AtomicU64,
    buffers: AtomicU64,
}

impl NullSink {
    pub fn new(output: OutputFormat) -> Self {
        Self {
            byte_rate: output.byte_rate().max(1),
            total_bytes: AtomicU64::new(0),
            buffers: AtomicU64::new(0),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }
}

impl PcmSink for NullSink {
    fn write(&self, pcm: &[u8]) -> usize {
        let total = self
            .total_bytes
            .fetch_add(pcm.len() as u64, Ordering::Relaxed)
            + pcm.len() as u64;
        self.buffers.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            len = pcm.len(),
            total_len = total,
            total_secs = total / self.byte_rate,
            "pcm discarded"
        );
        pcm.len()
    }
}

/// Appends raw interleaved PCM to a file.
pub struct RawFileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RawFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<()> {
        lock(&self.writer)
            .flush()
            .with_context(|| format!("flush {:?}", self.path))
    }
}

impl PcmSink for RawFileSink {
    fn write(&self, pcm: &[u8]) -> usize {
        match lock(&self.writer).write_all(pcm) {
            Ok(()) => pcm.len(),
            Err(e) => {
                tracing::warn!(path = ?self.path, "pcm file write failed: {e}");
                0
            }
        }
    }
}
