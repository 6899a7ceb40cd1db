//! One playback session: the media resources opened for a single source.
//!
//! A [`Session`] is built by [`SessionSetup::open`] and released only through
//! [`Session::release`] (or by being dropped during rollback). The player owns it;
//! while playing, it is moved into the dispatch thread and handed back on exit.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};

use crate::config::PlayerConfig;
use crate::convert::{ConversionCache, ConversionHandle};
use crate::lock;
use crate::media::{AudioDecoder, DecodedFrame, MediaBackend, MediaInput, Packet};
use crate::sink::PcmSink;
use crate::watchdog::{BlockCategory, InterruptHook, Watchdog};

/// Residue of a compressed packet not yet consumed by the decoder.
#[derive(Debug, Default)]
pub(crate) struct PendingPacket {
    packet: Option<Packet>,
    offset: usize,
}

impl PendingPacket {
    pub(crate) fn set(&mut self, packet: Packet) {
        self.packet = Some(packet);
        self.offset = 0;
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        match &self.packet {
            Some(p) => &p.data[self.offset.min(p.data.len())..],
            None => &[],
        }
    }

    /// Zero remaining bytes means the next iteration fetches a new packet.
    pub(crate) fn is_empty(&self) -> bool {
        self.remaining().is_empty()
    }

    pub(crate) fn stream(&self) -> Option<u32> {
        self.packet.as_ref().map(|p| p.stream)
    }

    pub(crate) fn ts(&self) -> u64 {
        self.packet.as_ref().map(|p| p.ts).unwrap_or(0)
    }

    pub(crate) fn advance(&mut self, consumed: usize) {
        self.offset = self.offset.saturating_add(consumed);
    }

    pub(crate) fn release(&mut self) {
        self.packet = None;
        self.offset = 0;
    }
}

/// Everything needed to open a session, cloneable into a preparation thread.
#[derive(Clone)]
pub(crate) struct SessionSetup {
    pub(crate) backend: Arc<dyn MediaBackend>,
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) cache: Arc<Mutex<Option<ConversionCache>>>,
    pub(crate) sink: Arc<dyn PcmSink>,
    pub(crate) config: PlayerConfig,
}

impl SessionSetup {
    /// Open `source` and build a ready-to-play session.
    ///
    /// Any failure drops what was allocated so far, in reverse order.
    pub(crate) fn open(&self, source: &str) -> Result<Session> {
        let output = lock(&self.cache)
            .as_ref()
            .map(|c| c.output_format())
            .ok_or_else(|| anyhow!("player is not initialised"))?;

        let hook = InterruptHook::new(self.watchdog.clone());
        let mut input = {
            let _blocking = self.watchdog.enter(BlockCategory::OpenInput);
            tracing::debug!(source, "opening input");
            self.backend
                .open_input(source, hook)
                .with_context(|| format!("could not open source {source}"))?
        };

        {
            let _blocking = self.watchdog.enter(BlockCategory::ReadHeader);
            tracing::debug!(source, "probing stream info");
            input
                .find_stream_info()
                .context("could not find stream information")?;
        }

        let (audio_stream, decoder) = input
            .open_best_audio_decoder()
            .context("could not open audio decoder")?;

        let frame = DecodedFrame::default();
        let scratch = Vec::with_capacity(self.config.scratch_bytes);
        let max_out_frames = (self.config.scratch_bytes / output.bytes_per_frame()).max(1);

        let format = decoder.input_format();
        let converter = select_converter(&self.cache, format)?;

        tracing::info!(
            source,
            audio_stream,
            input = %format,
            output = %output,
            "session prepared"
        );

        Ok(Session {
            source: source.to_string(),
            input,
            decoder,
            audio_stream,
            converter,
            cache: self.cache.clone(),
            frame,
            scratch,
            max_out_frames,
            pending: PendingPacket::default(),
            sink: self.sink.clone(),
        })
    }
}

/// Look up (or create) the conversion context for `format` in the shared cache.
pub(crate) fn select_converter(
    cache: &Mutex<Option<ConversionCache>>,
    format: crate::media::InputFormat,
) -> Result<ConversionHandle> {
    let handle = lock(cache)
        .as_mut()
        .ok_or_else(|| anyhow!("player is not initialised"))?
        .select(format)
        .with_context(|| format!("could not build conversion context for {format}"))?;
    lock(&handle).reset();
    Ok(handle)
}

/// Open media resources of one playback attempt.
pub(crate) struct Session {
    pub(crate) source: String,
    pub(crate) input: Box<dyn MediaInput>,
    pub(crate) decoder: Box<dyn AudioDecoder>,
    pub(crate) audio_stream: u32,
    pub(crate) converter: ConversionHandle,
    pub(crate) cache: Arc<Mutex<Option<ConversionCache>>>,
    pub(crate) frame: DecodedFrame,
    pub(crate) scratch: Vec<u8>,
    pub(crate) max_out_frames: usize,
    pub(crate) pending: PendingPacket,
    pub(crate) sink: Arc<dyn PcmSink>,
}

impl Session {
    /// Release every session-owned resource.
    ///
    /// The conversion context belongs to the cache and outlives the session, but
    /// its buffered audio does not.
    pub(crate) fn release(self) {
        let Session {
            source,
            input,
            decoder,
            converter,
            mut pending,
            frame,
            scratch,
            ..
        } = self;
        lock(&converter).reset();
        pending.release();
        drop(decoder);
        drop(input);
        drop(frame);
        drop(scratch);
        tracing::info!(source = %source, "session released");
    }
}
