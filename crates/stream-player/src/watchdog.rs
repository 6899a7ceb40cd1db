//! Blocking-call watchdog.
//!
//! Every blocking entry point into the media backend (open, probe, packet read)
//! runs inside a [`BlockCategory`]. The backend polls an [`InterruptHook`] while
//! it waits; the hook aborts once the time spent in the current category reaches
//! that category's timeout.
//!
//! The category and its entry timestamp are plain atomics: the thread making the
//! blocking call writes them, and the hook may read a value that is stale by one
//! category.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::WatchdogTimeouts;

/// Kind of blocking media call currently outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockCategory {
    None,
    OpenInput,
    ReadHeader,
    ReadFrame,
}

impl BlockCategory {
    fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::OpenInput => 1,
            Self::ReadHeader => 2,
            Self::ReadFrame => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::OpenInput,
            2 => Self::ReadHeader,
            3 => Self::ReadFrame,
            _ => Self::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::OpenInput => "open-input",
            Self::ReadHeader => "read-header",
            Self::ReadFrame => "read-frame",
        }
    }
}

impl fmt::Display for BlockCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Poll decision returned to the media backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Abort,
}

/// Tracks the outstanding blocking call and decides when to abort it.
#[derive(Debug)]
pub struct Watchdog {
    timeouts: WatchdogTimeouts,
    origin: Instant,
    category: AtomicU8,
    entered_nanos: AtomicU64,
}

impl Watchdog {
    pub fn new(timeouts: WatchdogTimeouts) -> Self {
        Self {
            timeouts,
            origin: Instant::now(),
            category: AtomicU8::new(BlockCategory::None.to_u8()),
            entered_nanos: AtomicU64::new(0),
        }
    }

    pub fn timeouts(&self) -> WatchdogTimeouts {
        self.timeouts
    }

    /// Record `category` as outstanding from now on.
    ///
    /// The returned guard resets the category to `None` when dropped.
    pub fn enter(&self, category: BlockCategory) -> WatchdogGuard<'_> {
        self.enter_at(category, Instant::now())
    }

    /// Same as [`Watchdog::enter`] with an explicit entry time.
    pub fn enter_at(&self, category: BlockCategory, at: Instant) -> WatchdogGuard<'_> {
        let nanos = at.saturating_duration_since(self.origin).as_nanos() as u64;
        self.entered_nanos.store(nanos, Ordering::Release);
        self.category.store(category.to_u8(), Ordering::Release);
        tracing::trace!(category = %category, "watchdog enter");
        WatchdogGuard { watchdog: self }
    }

    /// Mark that no blocking call is outstanding.
    pub fn clear(&self) {
        self.category
            .store(BlockCategory::None.to_u8(), Ordering::Release);
    }

    pub fn category(&self) -> BlockCategory {
        BlockCategory::from_u8(self.category.load(Ordering::Acquire))
    }

    /// Timeout for `category`, or `None` for a category that never aborts.
    pub fn timeout_for(&self, category: BlockCategory) -> Option<Duration> {
        match category {
            BlockCategory::None => None,
            BlockCategory::OpenInput => Some(self.timeouts.open_input),
            BlockCategory::ReadHeader => Some(self.timeouts.read_header),
            BlockCategory::ReadFrame => Some(self.timeouts.read_frame),
        }
    }

    pub fn poll(&self) -> Verdict {
        self.poll_at(Instant::now())
    }

    /// Decide whether the outstanding call should be aborted at time `now`.
    pub fn poll_at(&self, now: Instant) -> Verdict {
        let category = self.category();
        let Some(timeout) = self.timeout_for(category) else {
            return Verdict::Continue;
        };
        let entered = Duration::from_nanos(self.entered_nanos.load(Ordering::Acquire));
        let elapsed = now
            .saturating_duration_since(self.origin)
            .saturating_sub(entered);
        if elapsed >= timeout {
            tracing::error!(
                category = %category,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "blocking media call hit watchdog timeout"
            );
            return Verdict::Abort;
        }
        Verdict::Continue
    }
}

/// Clears the watchdog category when the blocking call returns.
#[must_use = "the category is cleared as soon as the guard is dropped"]
pub struct WatchdogGuard<'a> {
    watchdog: &'a Watchdog,
}

impl Drop for WatchdogGuard<'_> {
    fn drop(&mut self) {
        self.watchdog.clear();
    }
}

/// Interrupt hook handed to media backends.
///
/// Backends call [`InterruptHook::check`] periodically while blocked. The
/// decision depends only on watchdog state, so one hook serves every call site.
#[derive(Clone, Debug)]
pub struct InterruptHook {
    watchdog: Arc<Watchdog>,
}

impl InterruptHook {
    pub fn new(watchdog: Arc<Watchdog>) -> Self {
        Self { watchdog }
    }

    pub fn should_abort(&self) -> bool {
        self.watchdog.poll() == Verdict::Abort
    }

    pub fn timeouts(&self) -> WatchdogTimeouts {
        self.watchdog.timeouts()
    }

    /// Return a `TimedOut` error when the outstanding call must be abandoned.
    pub fn check(&self) -> io::Result<()> {
        if self.should_abort() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out", self.watchdog.category()),
            ));
        }
        Ok(())
    }
}
