//! Decode dispatch loop.
//!
//! Runs on its own thread while the player is `Playing`. Each iteration:
//! - read a compressed packet if none is pending (under the `ReadFrame` watchdog)
//! - drain converted output left over from an earlier frame, or
//! - decode one unit from the pending packet and convert it
//! - forward the PCM to the sink
//!
//! The loop leaves as soon as it observes any other phase and hands the
//! [`Session`] back through the thread's join handle.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;

use crate::lock;
use crate::phase::{Phase, PlaybackShared};
use crate::session::{Session, select_converter};
use crate::watchdog::BlockCategory;

/// Outcome of one loop iteration.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// A PCM buffer of this many bytes went to the sink.
    Forwarded(usize),
    /// Work was done but nothing was forwarded.
    Continue,
    /// The phase is no longer `Playing`.
    Halted,
    /// End of stream or an unrecoverable read/decode/convert error.
    Finished,
}

/// Launch the loop for `session` on a named thread.
pub(crate) fn spawn(session: Session, shared: Arc<PlaybackShared>) -> io::Result<JoinHandle<Session>> {
    thread::Builder::new()
        .name("decode-dispatch".to_string())
        .spawn(move || run(session, &shared))
}

/// Iterate until halted or finished, then return the session.
pub(crate) fn run(mut session: Session, shared: &PlaybackShared) -> Session {
    tracing::info!(source = %session.source, "decode loop started");
    let mut buffers = 0u64;
    let mut bytes = 0u64;

    loop {
        match step(&mut session, shared) {
            Step::Forwarded(len) => {
                buffers += 1;
                bytes += len as u64;
            }
            Step::Continue => {}
            Step::Halted => {
                tracing::info!(buffers, bytes, phase = %shared.phase(), "decode loop halted");
                break;
            }
            Step::Finished => {
                tracing::info!(buffers, bytes, "decode loop finished");
                shared.mark_finished();
                break;
            }
        }
    }
    session
}

/// Run one iteration of the loop.
pub(crate) fn step(session: &mut Session, shared: &PlaybackShared) -> Step {
    if shared.phase() != Phase::Playing {
        return Step::Halted;
    }

    if session.pending.is_empty() {
        let read = {
            let _blocking = shared.watchdog().enter(BlockCategory::ReadFrame);
            session.input.read_packet()
        };
        match read {
            Ok(Some(packet)) => session.pending.set(packet),
            Ok(None) => {
                tracing::info!(source = %session.source, "end of stream");
                return Step::Finished;
            }
            Err(e) => {
                tracing::error!(source = %session.source, "packet read failed: {e:#}");
                return Step::Finished;
            }
        }
    }

    if session.pending.stream() != Some(session.audio_stream) {
        tracing::trace!(stream = ?session.pending.stream(), "dropping packet of another stream");
        session.pending.release();
        return Step::Continue;
    }

    let last_frames = session.frame.frames;
    if last_frames > 0 {
        let mut converter = lock(&session.converter);
        if converter.buffered_frames() >= last_frames {
            let frames = converter.drain(&mut session.scratch, session.max_out_frames);
            drop(converter);
            if frames > 0 {
                return forward(session);
            }
            tracing::warn!(buffered_frames = last_frames, "converter drain produced no output");
        }
    }

    let ts = session.pending.ts();
    let outcome = match session
        .decoder
        .decode(ts, session.pending.remaining(), &mut session.frame)
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(source = %session.source, ts, "decode failed: {e:#}");
            return Step::Finished;
        }
    };

    if outcome.consumed == 0 && !outcome.got_frame {
        tracing::warn!(
            ts,
            remaining = session.pending.remaining().len(),
            "decoder made no progress, dropping packet"
        );
        session.pending.release();
        return Step::Continue;
    }

    session.pending.advance(outcome.consumed);
    if session.pending.is_empty() {
        session.pending.release();
    }

    if !outcome.got_frame {
        return Step::Continue;
    }

    if let Err(e) = follow_format_change(session) {
        tracing::error!("conversion context unavailable: {e:#}");
        return Step::Finished;
    }

    let converted = lock(&session.converter).convert(
        &session.frame,
        &mut session.scratch,
        session.max_out_frames,
    );
    match converted {
        Ok(0) => Step::Continue,
        Ok(_) => forward(session),
        Err(e) => {
            tracing::error!(ts, "conversion failed: {e:#}");
            Step::Finished
        }
    }
}

/// Switch the session to the cached context for a new decoder output format.
fn follow_format_change(session: &mut Session) -> Result<()> {
    let Some(format) = session.frame.format else {
        return Ok(());
    };
    let current = lock(&session.converter).input_format();
    if current == format {
        return Ok(());
    }
    tracing::warn!(from = %current, to = %format, "decoder output format changed mid-stream");
    session.converter = select_converter(&session.cache, format)?;
    Ok(())
}

fn forward(session: &Session) -> Step {
    let len = session.scratch.len();
    let accepted = session.sink.write(&session.scratch);
    if accepted < len {
        tracing::warn!(len, accepted, "sink accepted a short write");
    }
    Step::Forwarded(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::config::{OutputFormat, PlayerConfig, WatchdogTimeouts};
    use crate::convert::ConversionCache;
    use crate::media::{ChannelLayout, InputFormat, SampleFormat};
    use crate::session::SessionSetup;
    use crate::test_support::{CollectingSink, FailPoint, Script, ScriptedBackend, StallPoint};
    use crate::watchdog::Watchdog;

    struct Fixture {
        shared: Arc<PlaybackShared>,
        setup: SessionSetup,
        sink: Arc<CollectingSink>,
    }

    fn fixture(backend: ScriptedBackend, timeouts: WatchdogTimeouts) -> Fixture {
        let watchdog = Arc::new(Watchdog::new(timeouts));
        let sink = Arc::new(CollectingSink::default());
        let shared = Arc::new(PlaybackShared::new(watchdog.clone()));
        shared.set_phase(Phase::Playing);
        let setup = SessionSetup {
            backend: Arc::new(backend),
            watchdog,
            cache: Arc::new(Mutex::new(Some(ConversionCache::new(
                OutputFormat::from_params(1, 16_000, 16),
                1024,
            )))),
            sink: sink.clone(),
            config: PlayerConfig::default(),
        };
        Fixture {
            shared,
            setup,
            sink,
        }
    }

    fn step_until_done(session: &mut Session, shared: &PlaybackShared) -> Vec<Step> {
        let mut steps = Vec::new();
        for _ in 0..1000 {
            let step = step(session, shared);
            let done = matches!(step, Step::Finished | Step::Halted);
            steps.push(step);
            if done {
                break;
            }
        }
        steps
    }

    #[test]
    fn forwards_every_packet_then_finishes() {
        let backend = ScriptedBackend::new(Script {
            packets: 3,
            ..Script::default()
        });
        let f = fixture(backend, WatchdogTimeouts::default());
        let mut session = f.setup.open("mem://three").unwrap();

        let steps = step_until_done(&mut session, &f.shared);

        assert_eq!(steps.last(), Some(&Step::Finished));
        assert_eq!(f.sink.buffer_count(), 3);
        // 256 mono frames of s16 per packet
        assert!(f.sink.buffers().iter().all(|b| b.len() == 512));
        assert!(session.pending.is_empty());
        session.release();
    }

    #[test]
    fn partial_consumption_keeps_the_packet_pending() {
        let backend = ScriptedBackend::new(Script {
            packets: 1,
            packet_bytes: 64,
            consume_per_call: Some(16),
            ..Script::default()
        });
        let counters = backend.counters();
        let f = fixture(backend, WatchdogTimeouts::default());
        let mut session = f.setup.open("mem://partial").unwrap();

        assert_eq!(step(&mut session, &f.shared), Step::Forwarded(512));
        assert_eq!(session.pending.remaining().len(), 48);
        assert_eq!(counters.reads(), 1);

        for _ in 0..3 {
            assert_eq!(step(&mut session, &f.shared), Step::Forwarded(512));
        }
        assert!(session.pending.is_empty());
        assert_eq!(counters.reads(), 1);
        assert_eq!(counters.decodes(), 4);

        assert_eq!(step(&mut session, &f.shared), Step::Finished);
        session.release();
    }

    #[test]
    fn buffered_output_is_drained_before_decoding_more() {
        let backend = ScriptedBackend::new(Script {
            packets: 3,
            frames_per_packet: 3000,
            ..Script::default()
        });
        let counters = backend.counters();
        let f = fixture(backend, WatchdogTimeouts::default());
        let mut session = f.setup.open("mem://big").unwrap();
        session.max_out_frames = 1000;

        // first packet: 1000 frames out, 2000 buffered
        assert_eq!(step(&mut session, &f.shared), Step::Forwarded(2000));
        assert_eq!(counters.decodes(), 1);
        // 2000 buffered < 3000 last frame: decode the second packet
        assert_eq!(step(&mut session, &f.shared), Step::Forwarded(2000));
        assert_eq!(counters.decodes(), 2);
        // 4000 buffered >= 3000 last frame: drain without decoding
        assert_eq!(step(&mut session, &f.shared), Step::Forwarded(2000));
        assert_eq!(counters.decodes(), 2);
        assert_eq!(lock(&session.converter).buffered_frames(), 3000);
        session.release();
    }

    #[test]
    fn packets_of_other_streams_are_dropped() {
        let backend = ScriptedBackend::new(Script {
            packets: 2,
            foreign_at: vec![0, 2],
            ..Script::default()
        });
        let counters = backend.counters();
        let f = fixture(backend, WatchdogTimeouts::default());
        let mut session = f.setup.open("mem://mixed").unwrap();

        let steps = step_until_done(&mut session, &f.shared);

        assert_eq!(
            steps,
            vec![
                Step::Continue,
                Step::Forwarded(512),
                Step::Continue,
                Step::Forwarded(512),
                Step::Finished,
            ]
        );
        assert_eq!(counters.decodes(), 2);
        session.release();
    }

    #[test]
    fn decode_error_finishes_the_loop() {
        let backend = ScriptedBackend::new(Script {
            packets: 5,
            fail_at: Some(FailPoint::Decode(1)),
            ..Script::default()
        });
        let f = fixture(backend, WatchdogTimeouts::default());
        let session = f.setup.open("mem://corrupt").unwrap();

        let session = run(session, &f.shared);

        assert!(f.shared.is_finished());
        assert_eq!(f.sink.buffer_count(), 1);
        session.release();
    }

    #[test]
    fn read_error_finishes_the_loop() {
        let backend = ScriptedBackend::new(Script {
            packets: 5,
            fail_at: Some(FailPoint::Read(2)),
            ..Script::default()
        });
        let f = fixture(backend, WatchdogTimeouts::default());
        let session = f.setup.open("mem://flaky").unwrap();

        let session = run(session, &f.shared);

        assert!(f.shared.is_finished());
        assert_eq!(f.sink.buffer_count(), 2);
        session.release();
    }

    #[test]
    fn halts_without_reading_when_not_playing() {
        let backend = ScriptedBackend::new(Script::default());
        let counters = backend.counters();
        let f = fixture(backend, WatchdogTimeouts::default());
        let mut session = f.setup.open("mem://paused").unwrap();
        f.shared.set_phase(Phase::Paused);

        assert_eq!(step(&mut session, &f.shared), Step::Halted);
        assert_eq!(counters.reads(), 0);
        assert!(!f.shared.is_finished());
        session.release();
    }

    #[test]
    fn format_change_reselects_through_the_cache() {
        let stereo = InputFormat {
            channel_layout: ChannelLayout::STEREO,
            sample_format: SampleFormat::S16,
            sample_rate: 16_000,
        };
        let backend = ScriptedBackend::new(Script {
            packets: 4,
            switch_after: Some((2, stereo)),
            ..Script::default()
        });
        let f = fixture(backend, WatchdogTimeouts::default());
        let mut session = f.setup.open("mem://switch").unwrap();

        let steps = step_until_done(&mut session, &f.shared);

        assert_eq!(steps.last(), Some(&Step::Finished));
        assert_eq!(f.sink.buffer_count(), 4);
        assert_eq!(lock(&session.converter).input_format(), stereo);
        assert_eq!(lock(&f.setup.cache).as_ref().unwrap().len(), 2);
        session.release();
    }

    #[test]
    fn stalled_read_is_aborted_by_the_watchdog() {
        let backend = ScriptedBackend::new(Script {
            packets: 10,
            stall_at: Some(StallPoint::Read(1)),
            ..Script::default()
        });
        let f = fixture(
            backend,
            WatchdogTimeouts {
                read_frame: Duration::from_millis(100),
                ..WatchdogTimeouts::default()
            },
        );
        let session = f.setup.open("mem://stall").unwrap();

        let session = run(session, &f.shared);

        assert!(f.shared.is_finished());
        assert_eq!(f.sink.buffer_count(), 1);
        assert_eq!(f.setup.watchdog.category(), BlockCategory::None);
        session.release();
    }
}
