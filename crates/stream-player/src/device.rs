//! Output device discovery, selection and the device-backed PCM sink.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - playing sink PCM through a bounded queue drained by the output callback

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Sender, bounded};

use crate::config::{OutputFormat, OutputSampleFormat};
use crate::playback::{PlaybackConfig, build_output_stream};
use crate::queue::{SampleQueue, calc_max_buffered_samples};
use crate::sink::PcmSink;

/// Pick the first output device whose name contains `needle` (case-insensitive),
/// or the host default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `target_rate`.
///
/// Prefers the highest supported rate that is <= the target, then the lowest
/// rate above it; ties go to the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();

    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.map(|t| rate <= t).unwrap_or(true);
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, format_rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, format_rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, _, _, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Prefer a fixed buffer size if the device advertises a range.
///
/// Returns `None` when the device only supports its default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 16_384;
            let chosen = if *max > MAX_FRAMES {
                if *min > MAX_FRAMES { *min } else { MAX_FRAMES }
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

/// Print available output devices to stdout (`--list-devices`).
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

/// Append the samples encoded in `pcm` to `out` as `f32`.
///
/// A trailing partial sample is ignored.
fn pcm_to_f32(pcm: &[u8], format: OutputSampleFormat, out: &mut Vec<f32>) {
    match format {
        OutputSampleFormat::S16 => out.extend(
            pcm.chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32),
        ),
        OutputSampleFormat::S32 => out.extend(pcm.chunks_exact(4).map(|b| {
            (i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 / i32::MAX as f64) as f32
        })),
    }
}

/// Plays sink PCM on an output device.
///
/// `cpal::Stream` must stay on the thread that built it, so a dedicated
/// output thread owns the stream until the sink is dropped. `write` blocks
/// while the queue is full, pacing the decode loop to the device clock.
pub struct DeviceSink {
    output: OutputFormat,
    device_name: String,
    queue: Arc<SampleQueue>,
    played_frames: Arc<AtomicU64>,
    underrun_events: Arc<AtomicU64>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSink {
    /// Open the device matching `needle` (or the default) at the output format's rate.
    ///
    /// Fails when the device cannot run at exactly that rate.
    pub fn open(needle: Option<&str>, output: OutputFormat, buffer_seconds: f32) -> Result<Self> {
        let channels = output.channels as usize;
        let queue = Arc::new(SampleQueue::new(
            channels,
            calc_max_buffered_samples(output.sample_rate, channels, buffer_seconds),
        ));
        let played_frames = Arc::new(AtomicU64::new(0));
        let underrun_events = Arc::new(AtomicU64::new(0));
        let cfg = PlaybackConfig {
            refill_max_frames: 4096,
            played_frames: played_frames.clone(),
            underrun_events: underrun_events.clone(),
        };

        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let needle = needle.map(str::to_string);
        let queue_for_thread = queue.clone();

        let thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match open_stream(needle.as_deref(), output, &queue_for_thread, cfg) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("output stream closed");
            })
            .context("spawn audio output thread")?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                bail!("audio output thread exited during setup");
            }
        };

        Ok(Self {
            output,
            device_name,
            queue,
            played_frames,
            underrun_events,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn played_frames(&self) -> u64 {
        self.played_frames.load(Ordering::Relaxed)
    }

    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }

    /// Wait until the device played everything queued so far.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.queue.wait_until_empty(timeout)
    }
}

fn open_stream(
    needle: Option<&str>,
    output: OutputFormat,
    queue: &Arc<SampleQueue>,
    cfg: PlaybackConfig,
) -> Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = pick_device(&host, needle)?;
    let name = device
        .description()
        .map(|d| d.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let supported = pick_output_config(&device, Some(output.sample_rate))?;
    if supported.sample_rate() != output.sample_rate {
        bail!(
            "device {name} cannot run at {} Hz (closest supported: {} Hz)",
            output.sample_rate,
            supported.sample_rate()
        );
    }

    let sample_format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.config();
    if let Some(buffer_size) = pick_buffer_size(&supported) {
        config.buffer_size = buffer_size;
    }

    let stream = build_output_stream(&device, &config, sample_format, queue, cfg)?;
    stream.play().context("start output stream")?;
    tracing::info!(
        device = %name,
        channels = config.channels,
        rate = ?config.sample_rate,
        format = ?sample_format,
        "output stream started"
    );
    Ok((stream, name))
}

impl PcmSink for DeviceSink {
    fn write(&self, pcm: &[u8]) -> usize {
        let mut samples = Vec::with_capacity(pcm.len() / 2);
        pcm_to_f32(pcm, self.output.sample_format, &mut samples);
        let pushed = self.queue.push_interleaved_blocking(&samples);
        pushed * self.output.sample_format.bytes_per_sample()
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::info!(
            device = %self.device_name,
            played_frames = self.played_frames(),
            underruns = self.underrun_events(),
            "device sink closed"
        );
    }
}
