//! Bounded replay of one source.
//!
//! Plays the source, waits for the decode loop to finish on its own, stops the
//! player and pauses before the next attempt. Gives up after `max_plays`
//! attempts or as soon as `cancel` is raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::player::Player;

#[derive(Clone, Debug)]
pub struct ReplayPolicy {
    /// Upper bound on play attempts (failed ones included).
    pub max_plays: u32,
    /// Idle time between attempts.
    pub pause_between: Duration,
    /// How often a wait re-checks the cancel flag.
    pub poll_interval: Duration,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            max_plays: 100,
            pause_between: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Replay `source` under `policy`; returns how many attempts played to the end.
///
/// `on_finished` runs after a natural finish, before the player is stopped.
pub fn run(
    player: &Player,
    source: &str,
    policy: &ReplayPolicy,
    cancel: &AtomicBool,
    mut on_finished: impl FnMut(),
) -> Result<u32> {
    let mut completed = 0;

    for attempt in 1..=policy.max_plays {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        if let Err(e) = player.play(source) {
            tracing::warn!(attempt, "play failed: {e:#}");
            sleep_unless_cancelled(policy.pause_between, policy.poll_interval, cancel);
            continue;
        }

        let finished = loop {
            if cancel.load(Ordering::Relaxed) {
                break false;
            }
            if player.wait_finished(policy.poll_interval) {
                break true;
            }
        };
        if finished {
            on_finished();
            completed += 1;
        }
        player.stop()?;
        tracing::info!(attempt, finished, completed, "playback attempt ended");

        if attempt < policy.max_plays {
            sleep_unless_cancelled(policy.pause_between, policy.poll_interval, cancel);
        }
    }

    Ok(completed)
}

fn sleep_unless_cancelled(total: Duration, poll: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + total;
    let poll = poll.max(Duration::from_millis(1));
    while !cancel.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(poll.min(deadline - now));
    }
}
