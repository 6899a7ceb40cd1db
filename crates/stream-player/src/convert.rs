//! Sample format / rate / channel conversion.
//!
//! A [`ConversionContext`] turns decoded interleaved `f32` frames of one
//! [`InputFormat`] into PCM bytes of the fixed [`OutputFormat`]:
//! - remix channels (mono↔stereo, otherwise clamp to available channels)
//! - resample with Rubato when the rates differ
//! - quantise to signed 16/32-bit little endian
//!
//! Output that does not fit the caller's buffer stays inside the context and is
//! handed out by [`ConversionContext::drain`].
//!
//! [`ConversionCache`] keeps one context per input format observed during the
//! process lifetime.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::config::{OutputFormat, OutputSampleFormat};
use crate::media::{DecodedFrame, InputFormat};

/// Shared handle to a cached conversion context.
pub type ConversionHandle = Arc<Mutex<ConversionContext>>;

/// Streaming sinc resampler working on already-remixed interleaved samples.
struct ResampleStage {
    resampler: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    input: Vec<f32>,
    output: Vec<f32>,
    indexing: Indexing,
}

impl ResampleStage {
    fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let oversampling_factor = 256;
        let interpolation = SincInterpolationType::Cubic;
        let window = WindowFunction::BlackmanHarris2;
        let f_cutoff = calculate_cutoff(sinc_len, window);

        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            interpolation,
            oversampling_factor,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init error: {e}"))?;
        let output = vec![0.0f32; resampler.output_frames_max() * channels];

        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            input: Vec::with_capacity(chunk_frames * channels * 2),
            output,
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Forget filter history and any partial input chunk.
    fn reset(&mut self) {
        self.resampler.reset();
        self.input.clear();
    }

    /// Feed samples and push every fully resampled chunk into `pending`.
    fn process(&mut self, samples: &[f32], pending: &mut VecDeque<f32>) -> Result<()> {
        self.input.extend_from_slice(samples);
        let want = self.chunk_frames * self.channels;

        while self.input.len() >= want {
            let nbr_out = {
                let input_adapter =
                    InterleavedSlice::new(&self.input[..want], self.channels, self.chunk_frames)
                        .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
                let out_capacity_frames = self.output.len() / self.channels;
                let mut output_adapter =
                    InterleavedSlice::new_mut(&mut self.output, self.channels, out_capacity_frames)
                        .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

                self.indexing.input_offset = 0;
                self.indexing.output_offset = 0;
                self.indexing.partial_len = None;

                let (_nbr_in, nbr_out) = self
                    .resampler
                    .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
                    .map_err(|e| anyhow!("resampler process error: {e}"))?;
                nbr_out
            };

            pending.extend(&self.output[..nbr_out * self.channels]);
            self.input.drain(..want);
        }
        Ok(())
    }
}

/// Converter from one input format to the fixed output format.
pub struct ConversionContext {
    input: InputFormat,
    output: OutputFormat,
    resample: Option<ResampleStage>,
    remixed: Vec<f32>,
    pending: VecDeque<f32>,
}

impl ConversionContext {
    pub fn new(input: InputFormat, output: OutputFormat, chunk_frames: usize) -> Result<Self> {
        if input.sample_rate == 0 || input.channels() == 0 {
            bail!("invalid input format {input}");
        }
        if output.sample_rate == 0 {
            bail!("invalid output format {output}");
        }
        let resample = if input.sample_rate == output.sample_rate {
            None
        } else {
            Some(ResampleStage::new(
                input.sample_rate,
                output.sample_rate,
                output.channels as usize,
                chunk_frames,
            )?)
        };
        Ok(Self {
            input,
            output,
            resample,
            remixed: Vec::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn input_format(&self) -> InputFormat {
        self.input
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output
    }

    pub fn is_resampling(&self) -> bool {
        self.resample.is_some()
    }

    /// Drop all stream state so the next frame starts a fresh stream.
    ///
    /// Held-back output, the resampler's partial chunk and its filter history
    /// are discarded; the context itself stays usable.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.remixed.clear();
        if let Some(stage) = self.resample.as_mut() {
            stage.reset();
        }
    }

    /// Converted frames held back because they did not fit a previous output buffer.
    pub fn buffered_frames(&self) -> usize {
        self.pending.len() / self.output.channels as usize
    }

    /// Convert `frame` and write up to `max_frames` output frames into `out`.
    ///
    /// `out` is cleared first. Returns the number of frames written; the byte
    /// length is `frames * bytes_per_sample * output_channels`.
    pub fn convert(
        &mut self,
        frame: &DecodedFrame,
        out: &mut Vec<u8>,
        max_frames: usize,
    ) -> Result<usize> {
        let src_channels = self.input.channels();
        if frame.samples.len() % src_channels != 0 {
            bail!(
                "frame has {} samples, not a multiple of {} channels",
                frame.samples.len(),
                src_channels
            );
        }

        let dst_channels = self.output.channels as usize;
        self.remixed.clear();
        for src in frame.samples.chunks_exact(src_channels) {
            remix_frame(src, dst_channels, &mut self.remixed);
        }

        match self.resample.as_mut() {
            Some(stage) => stage.process(&self.remixed, &mut self.pending)?,
            None => self.pending.extend(&self.remixed),
        }

        Ok(self.drain(out, max_frames))
    }

    /// Hand out up to `max_frames` previously buffered frames into `out`.
    pub fn drain(&mut self, out: &mut Vec<u8>, max_frames: usize) -> usize {
        out.clear();
        let frames = self.buffered_frames().min(max_frames);
        let take = frames * self.output.channels as usize;
        let format = self.output.sample_format;
        for sample in self.pending.drain(..take) {
            write_sample(sample, format, out);
        }
        frames
    }
}

/// Append one destination frame mapped from the source frame `src`.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available channels
fn remix_frame(src: &[f32], dst_channels: usize, out: &mut Vec<f32>) {
    let src_channels = src.len();
    for dst_ch in 0..dst_channels {
        let sample = match (src_channels, dst_channels) {
            (2, 1) => 0.5 * (src[0] + src[1]),
            (1, _) => src[0],
            _ => src[dst_ch.min(src_channels - 1)],
        };
        out.push(sample);
    }
}

fn write_sample(sample: f32, format: OutputSampleFormat, out: &mut Vec<u8>) {
    let s = if sample.is_finite() {
        sample.clamp(-1.0, 1.0)
    } else {
        0.0
    };
    match format {
        OutputSampleFormat::S16 => {
            let v = (s * i16::MAX as f32).round() as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        OutputSampleFormat::S32 => {
            let v = (s as f64 * i32::MAX as f64).round() as i32;
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// Process-lifetime cache of conversion contexts keyed by input format.
///
/// Entries are never evicted; [`ConversionCache::clear`] destroys them all.
pub struct ConversionCache {
    output: OutputFormat,
    chunk_frames: usize,
    entries: HashMap<InputFormat, ConversionHandle>,
}

impl ConversionCache {
    pub fn new(output: OutputFormat, chunk_frames: usize) -> Self {
        Self {
            output,
            chunk_frames,
            entries: HashMap::new(),
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the context for `input`, creating and caching it on first use.
    pub fn select(&mut self, input: InputFormat) -> Result<ConversionHandle> {
        if let Some(existing) = self.entries.get(&input) {
            tracing::info!(input = %input, "reusing cached conversion context");
            return Ok(existing.clone());
        }

        let context = ConversionContext::new(input, self.output, self.chunk_frames)?;
        tracing::info!(
            input = %input,
            output = %self.output,
            resampling = context.is_resampling(),
            cached = self.entries.len() + 1,
            "created conversion context"
        );
        let handle = Arc::new(Mutex::new(context));
        self.entries.insert(input, handle.clone());
        Ok(handle)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, input: &InputFormat) -> Option<ConversionHandle> {
        self.entries.get(input).cloned()
    }

    /// Point the cache at a new output format, discarding contexts built for the old one.
    pub fn retarget(&mut self, output: OutputFormat) {
        if output != self.output {
            self.clear();
            self.output = output;
        }
    }

    /// Destroy every cached context.
    pub fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        if count > 0 {
            tracing::info!(count, "destroyed conversion contexts");
        }
    }
}
