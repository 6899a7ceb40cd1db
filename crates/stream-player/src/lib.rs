//! Single-stream audio player core.
//!
//! A [`player::Player`] drives one playback session at a time through a small
//! state machine (`Idle`, `Preparing`, `Prepared`, `Paused`, `Playing`):
//! - setup opens and probes the source under a [`watchdog::Watchdog`] so stalled
//!   network reads can be aborted
//! - decoded frames go through a cached [`convert::ConversionContext`] into the
//!   fixed output format
//! - a background dispatch thread forwards PCM bytes to a [`sink::PcmSink`]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod convert;
pub mod decode;
pub mod device;
pub mod media;
pub mod phase;
pub mod player;
pub mod replay;
pub mod sink;
pub mod watchdog;

mod dispatch;
mod http_source;
mod playback;
mod queue;
mod session;

#[cfg(test)]
mod test_support;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
