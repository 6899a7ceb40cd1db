//! Bounded sample queue between the PCM sink and the output callback.
//!
//! The dispatch thread pushes (and blocks when the queue is full, which paces
//! decoding to the device clock). The CPAL callback pops without blocking.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::lock;

/// Thread-safe bounded queue of interleaved `f32` samples.
///
/// A `done` flag lives under the same mutex as the samples; the condvar signals
/// any change to either.
pub(crate) struct SampleQueue {
    channels: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct QueueInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// Queue capacity in samples for `buffer_seconds` of audio.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub(crate) fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SampleQueue {
    pub(crate) fn new(channels: usize, max_buffered_samples: usize) -> Self {
        Self {
            channels: channels.max(1),
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels.max(1)),
        }
    }

    pub(crate) fn channels(&self) -> usize {
        self.channels
    }

    #[cfg(test)]
    fn len_frames(&self) -> usize {
        lock(&self.inner).queue.len() / self.channels
    }

    #[cfg(test)]
    fn is_done(&self) -> bool {
        lock(&self.inner).done
    }

    /// Stop accepting samples and wake every waiter. Idempotent.
    pub(crate) fn close(&self) {
        lock(&self.inner).done = true;
        self.cv.notify_all();
    }

    /// Push samples, waiting for room when the queue is full.
    ///
    /// Returns how many samples were accepted; fewer than `samples.len()` only
    /// when the queue was closed meanwhile.
    pub(crate) fn push_interleaved_blocking(&self, samples: &[f32]) -> usize {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = lock(&self.inner);
            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.done {
                return offset;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        offset
    }

    /// Return up to `max_frames` whole frames without waiting, or `None` when empty.
    pub(crate) fn pop_available(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = lock(&self.inner);
        let take_frames = (g.queue.len() / self.channels).min(max_frames);
        let take_samples = take_frames * self.channels;
        if take_samples == 0 {
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Wait until every queued sample was consumed, or `timeout` elapses.
    pub(crate) fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = lock(&self.inner);
        while !g.queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            g = match self.cv.wait_timeout(g, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
