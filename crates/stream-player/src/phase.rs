//! Playback phase and the state shared between the control thread and the
//! dispatch thread.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::lock;
use crate::watchdog::Watchdog;

/// Current state of the playback state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Preparing,
    Prepared,
    Paused,
    Playing,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Paused => "paused",
            Self::Playing => "playing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control events accepted by the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerEvent {
    Play,
    Prepare,
    Start,
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for PlayerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Play => "play",
            Self::Prepare => "prepare",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        };
        f.write_str(name)
    }
}

struct SharedInner {
    phase: Phase,
    finished: bool,
}

/// Phase cell plus watchdog, shared by the control thread and the dispatch thread.
///
/// The phase and the `finished` flag live under one mutex; the condvar signals
/// any change to either.
pub(crate) struct PlaybackShared {
    inner: Mutex<SharedInner>,
    cv: Condvar,
    watchdog: Arc<Watchdog>,
}

impl PlaybackShared {
    pub(crate) fn new(watchdog: Arc<Watchdog>) -> Self {
        Self {
            inner: Mutex::new(SharedInner {
                phase: Phase::Idle,
                finished: false,
            }),
            cv: Condvar::new(),
            watchdog,
        }
    }

    pub(crate) fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub(crate) fn phase(&self) -> Phase {
        lock(&self.inner).phase
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let mut g = lock(&self.inner);
        g.phase = phase;
        drop(g);
        tracing::trace!(phase = %phase, "phase set");
        self.cv.notify_all();
    }

    /// Record that the dispatch loop ran out of input or hit a fatal error.
    pub(crate) fn mark_finished(&self) {
        let mut g = lock(&self.inner);
        g.finished = true;
        drop(g);
        self.cv.notify_all();
    }

    pub(crate) fn clear_finished(&self) {
        lock(&self.inner).finished = false;
    }

    pub(crate) fn is_finished(&self) -> bool {
        lock(&self.inner).finished
    }

    /// Block until the dispatch loop reports it finished, or `timeout` elapses.
    pub(crate) fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = lock(&self.inner);
        while !g.finished {
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
