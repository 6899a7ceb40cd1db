use std::fmt;
use std::time::Duration;

/// Integer sample encoding written to the PCM sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputSampleFormat {
    /// Signed 16-bit little endian.
    S16,
    /// Signed 32-bit little endian.
    S32,
}

impl OutputSampleFormat {
    /// 16 selects S16; every other depth selects S32.
    pub fn from_bit_depth(bits: u16) -> Self {
        if bits == 16 { Self::S16 } else { Self::S32 }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16 => 2,
            Self::S32 => 4,
        }
    }
}

/// Fixed output format every conversion context targets.
///
/// Set once by `Player::init` and constant for the lifetime of the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: OutputSampleFormat,
}

impl OutputFormat {
    /// Build the output format from init parameters.
    ///
    /// One channel means mono; any other count is treated as stereo.
    pub fn from_params(channels: u16, sample_rate: u32, bits: u16) -> Self {
        Self {
            channels: if channels == 1 { 1 } else { 2 },
            sample_rate,
            sample_format: OutputSampleFormat::from_bit_depth(bits),
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    /// Bytes of PCM per second of audio.
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.bytes_per_frame() as u64
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}ch/{}Hz/{:?}",
            self.channels, self.sample_rate, self.sample_format
        )
    }
}

/// Per-category limits for blocking media calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogTimeouts {
    pub open_input: Duration,
    pub read_header: Duration,
    pub read_frame: Duration,
}

impl Default for WatchdogTimeouts {
    fn default() -> Self {
        Self {
            open_input: Duration::from_secs(30),
            read_header: Duration::from_secs(4),
            read_frame: Duration::from_secs(5),
        }
    }
}

/// Player tuning parameters shared by setup, the dispatch loop and the backends.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Size of the per-session output scratch buffer in bytes.
    pub scratch_bytes: usize,
    /// Resampler input chunk size in frames.
    pub resample_chunk_frames: usize,
    /// Blocking-call limits enforced by the watchdog.
    pub timeouts: WatchdogTimeouts,
    /// How often a blocked read re-checks the interrupt hook.
    pub interrupt_poll: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            scratch_bytes: 8 * 1024,
            resample_chunk_frames: 1024,
            timeouts: WatchdogTimeouts::default(),
            interrupt_poll: Duration::from_millis(50),
        }
    }
}
