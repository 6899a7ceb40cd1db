//! CPAL output stream fed from a [`SampleQueue`].
//!
//! The callback refills a small local buffer from the queue without blocking,
//! maps channels when the device layout differs from the queue's, and converts
//! `f32` samples to the device sample format. Underruns are filled with silence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::lock;
use crate::queue::SampleQueue;

/// Settings and counters for the output callback.
#[derive(Clone, Debug)]
pub(crate) struct PlaybackConfig {
    /// Maximum frames pulled from the queue per refill.
    pub(crate) refill_max_frames: usize,
    /// Incremented by the number of frames played.
    pub(crate) played_frames: Arc<AtomicU64>,
    /// Incremented each time the callback runs dry.
    pub(crate) underrun_events: Arc<AtomicU64>,
}

/// Build a CPAL output stream that plays interleaved `f32` audio from `queue`.
pub(crate) fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, cfg),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels_out = (config.channels as usize).max(1);
    let state = Mutex::new(PlaybackState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
    });
    let refill_max_frames = cfg.refill_max_frames.max(1);
    let queue_cb = queue.clone();
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let mut st = lock(&state);
            let frames = data.len() / channels_out;
            let mut filled_frames = 0usize;

            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    match queue_cb.pop_available(refill_max_frames) {
                        Some(v) => st.src = v,
                        None => {
                            st.src.clear();
                            cfg.underrun_events.fetch_add(1, Ordering::Relaxed);
                            data[frame * channels_out..].fill(silence);
                            break;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch);
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
                filled_frames += 1;
            }

            if filled_frames > 0 {
                cfg.played_frames
                    .fetch_add(filled_frames as u64, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Local buffer the callback drains between queue refills.
struct PlaybackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Read one output sample for `dst_ch`.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available channels
///
/// `st.pos` advances once per destination frame, after its last channel.
fn next_sample_mapped(st: &mut PlaybackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &PlaybackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, _) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}
