//! Playback control state machine.
//!
//! [`Player`] is the control surface: it serializes events, opens and releases
//! session resources around transitions and owns the decode thread.
//!
//! | phase     | event          | next                      |
//! |-----------|----------------|---------------------------|
//! | idle      | play           | playing (idle on failure) |
//! | idle      | prepare        | preparing                 |
//! | preparing | start / resume | playing (idle on failure) |
//! | prepared  | start / resume | playing                   |
//! | prepared  | stop           | idle                      |
//! | playing   | pause          | paused                    |
//! | playing   | stop           | idle                      |
//! | paused    | resume         | playing                   |
//! | paused    | stop           | idle                      |
//!
//! Anything else is rejected and leaves the player untouched.

use std::mem;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::config::{OutputFormat, PlayerConfig};
use crate::convert::ConversionCache;
use crate::dispatch;
use crate::lock;
use crate::media::MediaBackend;
use crate::phase::{Phase, PlaybackShared, PlayerEvent};
use crate::session::{Session, SessionSetup};
use crate::sink::PcmSink;
use crate::watchdog::Watchdog;

/// Where the current session lives.
enum SessionSlot {
    Empty,
    /// Being opened by the preparation thread; `None` once it failed.
    Preparing(JoinHandle<Option<Session>>),
    /// Moved into the decode thread; handed back when it exits.
    Running(JoinHandle<Session>),
}

/// Single-stream audio player.
///
/// All methods take `&self`; events are serialized internally, so a `Player`
/// can be shared between threads behind an `Arc`.
pub struct Player {
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    sink: Arc<dyn PcmSink>,
    shared: Arc<PlaybackShared>,
    cache: Arc<Mutex<Option<ConversionCache>>>,
    control: Mutex<SessionSlot>,
}

impl Player {
    pub fn new(backend: Arc<dyn MediaBackend>, sink: Arc<dyn PcmSink>, config: PlayerConfig) -> Self {
        let watchdog = Arc::new(Watchdog::new(config.timeouts));
        Self {
            config,
            backend,
            sink,
            shared: Arc::new(PlaybackShared::new(watchdog)),
            cache: Arc::new(Mutex::new(None)),
            control: Mutex::new(SessionSlot::Empty),
        }
    }

    /// Set the fixed output format every conversion targets.
    ///
    /// `channels == 1` selects mono, anything else stereo; `bits == 16` selects
    /// S16, anything else S32. Only allowed while idle. Changing the format
    /// discards the cached conversion contexts.
    pub fn init(&self, channels: u16, sample_rate: u32, bits: u16) -> Result<()> {
        let _slot = lock(&self.control);
        let phase = self.shared.phase();
        if phase != Phase::Idle {
            bail!("init is only allowed while idle (player is {phase})");
        }
        if sample_rate == 0 {
            bail!("output sample rate must be non-zero");
        }

        let output = OutputFormat::from_params(channels, sample_rate, bits);
        let mut cache = lock(&self.cache);
        match cache.as_mut() {
            Some(existing) => existing.retarget(output),
            None => *cache = Some(ConversionCache::new(output, self.config.resample_chunk_frames)),
        }
        tracing::info!(output = %output, "player initialised");
        Ok(())
    }

    /// Stop any active session and destroy every cached conversion context.
    pub fn finalize(&self) -> Result<()> {
        let mut slot = lock(&self.control);
        let phase = self.shared.phase();
        if phase != Phase::Idle || !matches!(*slot, SessionSlot::Empty) {
            tracing::info!(phase = %phase, "finalize: stopping active session");
            self.shutdown(&mut slot, phase);
        }
        if let Some(mut cache) = lock(&self.cache).take() {
            cache.clear();
        }
        tracing::info!("player finalized");
        Ok(())
    }

    /// Open `source` and start playing it.
    pub fn play(&self, source: &str) -> Result<()> {
        self.handle(PlayerEvent::Play, Some(source))
    }

    /// Open `source` in the background; `start` begins playback once it is ready.
    pub fn prepare(&self, source: &str) -> Result<()> {
        self.handle(PlayerEvent::Prepare, Some(source))
    }

    pub fn start(&self) -> Result<()> {
        self.handle(PlayerEvent::Start, None)
    }

    pub fn pause(&self) -> Result<()> {
        self.handle(PlayerEvent::Pause, None)
    }

    pub fn resume(&self) -> Result<()> {
        self.handle(PlayerEvent::Resume, None)
    }

    pub fn stop(&self) -> Result<()> {
        self.handle(PlayerEvent::Stop, None)
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn is_playing(&self) -> bool {
        self.phase() == Phase::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.phase() == Phase::Paused
    }

    /// Whether the decode loop of the current session ran out of input or failed.
    ///
    /// The phase stays `Playing` when that happens; callers decide when to stop.
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Block until the decode loop finishes on its own, or `timeout` elapses.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.shared.wait_finished(timeout)
    }

    /// Output format set by `init`, if any.
    pub fn output_format(&self) -> Option<OutputFormat> {
        lock(&self.cache).as_ref().map(ConversionCache::output_format)
    }

    /// Number of cached conversion contexts.
    pub fn cached_conversions(&self) -> usize {
        lock(&self.cache).as_ref().map_or(0, ConversionCache::len)
    }

    fn setup(&self) -> SessionSetup {
        SessionSetup {
            backend: self.backend.clone(),
            watchdog: self.shared.watchdog().clone(),
            cache: self.cache.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
        }
    }

    fn handle(&self, event: PlayerEvent, source: Option<&str>) -> Result<()> {
        let mut slot = lock(&self.control);
        let from = self.shared.phase();

        let result = match (from, event) {
            (Phase::Idle, PlayerEvent::Play) => self.play_from_idle(&mut slot, source),
            (Phase::Idle, PlayerEvent::Prepare) => self.prepare_from_idle(&mut slot, source),
            (Phase::Preparing | Phase::Prepared, PlayerEvent::Start | PlayerEvent::Resume) => {
                self.relaunch(&mut slot)
            }
            (Phase::Paused, PlayerEvent::Resume) => self.relaunch(&mut slot),
            (Phase::Playing, PlayerEvent::Pause) => {
                self.shared.set_phase(Phase::Paused);
                Ok(())
            }
            (Phase::Prepared | Phase::Playing | Phase::Paused, PlayerEvent::Stop) => {
                self.shutdown(&mut slot, from);
                Ok(())
            }
            _ => Err(anyhow!("invalid transition: {event} while {from}")),
        };

        let phase = self.shared.phase();
        match &result {
            Ok(()) => tracing::info!(event = %event, from = %from, phase = %phase, "event OK"),
            Err(e) => {
                tracing::warn!(event = %event, from = %from, phase = %phase, "event FAILED: {e:#}")
            }
        }
        result
    }

    fn play_from_idle(&self, slot: &mut SessionSlot, source: Option<&str>) -> Result<()> {
        let source = source.ok_or_else(|| anyhow!("play needs a source"))?;
        self.discard_stale(slot);
        let session = self.setup().open(source)?;
        self.launch(slot, session)
    }

    fn prepare_from_idle(&self, slot: &mut SessionSlot, source: Option<&str>) -> Result<()> {
        let source = source.ok_or_else(|| anyhow!("prepare needs a source"))?.to_string();
        self.discard_stale(slot);
        if self.output_format().is_none() {
            bail!("player is not initialised");
        }

        let setup = self.setup();
        let shared = self.shared.clone();
        self.shared.set_phase(Phase::Preparing);
        let spawned = thread::Builder::new()
            .name("prepare".to_string())
            .spawn(move || match setup.open(&source) {
                Ok(session) => {
                    shared.set_phase(Phase::Prepared);
                    Some(session)
                }
                Err(e) => {
                    tracing::error!(source = %source, "preparation failed: {e:#}");
                    shared.set_phase(Phase::Idle);
                    None
                }
            });
        match spawned {
            Ok(handle) => {
                *slot = SessionSlot::Preparing(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_phase(Phase::Idle);
                Err(e).context("could not spawn preparation thread")
            }
        }
    }

    /// Reclaim the session from the preparation or a halted decode thread and
    /// launch a new decode loop for it.
    fn relaunch(&self, slot: &mut SessionSlot) -> Result<()> {
        match take_session(slot) {
            Some(session) => self.launch(slot, session),
            None => {
                self.shared.set_phase(Phase::Idle);
                bail!("no prepared session to start")
            }
        }
    }

    fn launch(&self, slot: &mut SessionSlot, session: Session) -> Result<()> {
        self.shared.clear_finished();
        self.shared.set_phase(Phase::Playing);
        match dispatch::spawn(session, self.shared.clone()) {
            Ok(handle) => {
                *slot = SessionSlot::Running(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_phase(Phase::Idle);
                Err(e).context("could not spawn decode thread")
            }
        }
    }

    /// Tear down the current session, whatever state it is in, and go idle.
    fn shutdown(&self, slot: &mut SessionSlot, from: Phase) {
        if from == Phase::Playing {
            self.shared.set_phase(Phase::Idle);
        }
        if let Some(session) = take_session(slot) {
            session.release();
        }
        self.shared.set_phase(Phase::Idle);
    }

    /// Join a preparation thread that failed while nobody was waiting on it.
    fn discard_stale(&self, slot: &mut SessionSlot) {
        if let Some(session) = take_session(slot) {
            tracing::warn!(source = %session.source, "releasing stale session");
            session.release();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let phase = self.shared.phase();
        let slot = self
            .control
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if matches!(slot, SessionSlot::Empty) {
            return;
        }
        let mut slot = mem::replace(slot, SessionSlot::Empty);
        self.shutdown(&mut slot, phase);
    }
}

/// Take the session back from whichever thread holds it.
///
/// Joining waits for the preparation to complete or for the decode loop to
/// observe a non-playing phase.
fn take_session(slot: &mut SessionSlot) -> Option<Session> {
    match mem::replace(slot, SessionSlot::Empty) {
        SessionSlot::Empty => None,
        SessionSlot::Preparing(handle) => handle.join().unwrap_or_else(|_| {
            tracing::error!("preparation thread panicked");
            None
        }),
        SessionSlot::Running(handle) => match handle.join() {
            Ok(session) => Some(session),
            Err(_) => {
                tracing::error!("decode thread panicked");
                None
            }
        },
    }
}
