//! Media library seam.
//!
//! The player only needs a handful of operations from a demux/decode library:
//! open an input with an interrupt hook installed, probe stream info, open the
//! best audio decoder, read compressed packets and decode them. Any of the
//! input operations may block; implementations must poll the [`InterruptHook`]
//! while they do.

use std::fmt;

use anyhow::Result;

use crate::watchdog::InterruptHook;

/// Channel layout as a speaker bitmask (front-left = bit 0, front-right = bit 1, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelLayout(u32);

impl ChannelLayout {
    pub const MONO: Self = Self(0b1);
    pub const STEREO: Self = Self(0b11);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Default layout for a bare channel count.
    pub fn default_for(channels: usize) -> Self {
        match channels {
            1 => Self::MONO,
            2 => Self::STEREO,
            n => Self((1u32 << n.min(31)) - 1),
        }
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }
}

/// Native sample encoding reported by a decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    U16,
    U24,
    U32,
    S8,
    S16,
    S24,
    S32,
    F32,
    F64,
}

/// Key of the conversion-context cache: the decoder's native output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputFormat {
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
}

impl InputFormat {
    pub fn channels(&self) -> usize {
        self.channel_layout.count()
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layout={:#x}/{:?}/{}Hz",
            self.channel_layout.bits(),
            self.sample_format,
            self.sample_rate
        )
    }
}

/// One compressed packet read from the input.
#[derive(Clone, Debug)]
pub struct Packet {
    pub stream: u32,
    pub ts: u64,
    pub data: Box<[u8]>,
}

/// Decoded audio as interleaved `f32`, plus the format the decoder produced it in.
#[derive(Clone, Debug, Default)]
pub struct DecodedFrame {
    pub format: Option<InputFormat>,
    pub frames: usize,
    pub samples: Vec<f32>,
}

/// Result of one decode call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeOutcome {
    /// Bytes of the packet the decoder consumed.
    pub consumed: usize,
    /// Whether `frame` now holds new audio.
    pub got_frame: bool,
}

/// Entry point of a media library.
pub trait MediaBackend: Send + Sync {
    /// Open `source` (local path or URL). `hook` must be polled while blocked.
    fn open_input(&self, source: &str, hook: InterruptHook) -> Result<Box<dyn MediaInput>>;
}

/// An opened input stream.
pub trait MediaInput: Send {
    /// Read enough of the stream to learn its tracks and codec parameters.
    fn find_stream_info(&mut self) -> Result<()>;

    /// Locate the best audio stream and open a decoder for it.
    ///
    /// Returns the stream id packets for it will carry.
    fn open_best_audio_decoder(&mut self) -> Result<(u32, Box<dyn AudioDecoder>)>;

    /// Read the next packet; `Ok(None)` means end of stream.
    fn read_packet(&mut self) -> Result<Option<Packet>>;
}

/// Decoder for one audio stream.
pub trait AudioDecoder: Send {
    /// Native format the decoder reports before the first frame.
    fn input_format(&self) -> InputFormat;

    /// Decode from `data` (the unconsumed tail of a packet with timestamp `ts`).
    fn decode(&mut self, ts: u64, data: &[u8], frame: &mut DecodedFrame) -> Result<DecodeOutcome>;
}
