//! stream-play: plays one audio source repeatedly through the stream-player core.
//!
//! The source (file or http URL) is decoded, converted to the fixed output format
//! given on the command line and handed to the selected sink:
//! - `null`: discard PCM and log running totals
//! - `device`: play on a CPAL output device at exactly the output rate
//! - `file`: append raw interleaved PCM to a file
//!
//! Ctrl-C stops the current play and ends the replay loop.

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use stream_player::config::{OutputFormat, PlayerConfig, WatchdogTimeouts};
use stream_player::decode::SymphoniaBackend;
use stream_player::device::{self, DeviceSink};
use stream_player::player::Player;
use stream_player::replay::{self, ReplayPolicy};
use stream_player::sink::{NullSink, PcmSink, RawFileSink};
use tracing_subscriber::EnvFilter;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

enum Output {
    Null(Arc<NullSink>),
    Device(Arc<DeviceSink>),
    File(Arc<RawFileSink>),
}

impl Output {
    fn open(args: &cli::Args, format: OutputFormat) -> Result<Self> {
        Ok(match args.output {
            cli::OutputKind::Null => Output::Null(Arc::new(NullSink::new(format))),
            cli::OutputKind::Device => {
                let sink = DeviceSink::open(args.device.as_deref(), format, args.buffer_seconds)?;
                tracing::info!(device = %sink.device_name(), "output device");
                Output::Device(Arc::new(sink))
            }
            cli::OutputKind::File => {
                let Some(path) = args.output_file.as_deref() else {
                    bail!("--output file needs --output-file");
                };
                Output::File(Arc::new(RawFileSink::create(path)?))
            }
        })
    }

    fn sink(&self) -> Arc<dyn PcmSink> {
        match self {
            Output::Null(s) => s.clone(),
            Output::Device(s) => s.clone(),
            Output::File(s) => s.clone(),
        }
    }

    /// Let queued audio reach its destination after a play finished.
    fn settle(&self) {
        if let Output::Device(s) = self {
            if !s.drain(DRAIN_TIMEOUT) {
                tracing::warn!("device did not drain in time");
            }
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            Output::Null(s) => {
                tracing::info!(bytes = s.total_bytes(), buffers = s.buffers(), "null sink totals");
            }
            Output::Device(s) => {
                tracing::info!(
                    played_frames = s.played_frames(),
                    underruns = s.underrun_events(),
                    "device totals"
                );
            }
            Output::File(s) => {
                s.flush()?;
                tracing::info!(path = ?s.path(), "pcm written");
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stream_player=info,stream_play=info")
        }))
        .init();

    if args.list_devices {
        device::list_devices(&cpal::default_host())?;
        return Ok(());
    }

    let Some(source) = args.source.clone() else {
        bail!("no source given (pass a file path or URL)");
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_for_signal = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received; stopping");
        cancel_for_signal.store(true, Ordering::Relaxed);
    })
    .context("install ctrl-c handler")?;

    let format = OutputFormat::from_params(args.channels, args.rate, args.bits);
    let output = Output::open(&args, format)?;

    let config = PlayerConfig {
        resample_chunk_frames: args.chunk_frames.max(1),
        timeouts: WatchdogTimeouts {
            open_input: Duration::from_millis(args.open_timeout_ms),
            read_header: Duration::from_millis(args.header_timeout_ms),
            read_frame: Duration::from_millis(args.frame_timeout_ms),
        },
        ..PlayerConfig::default()
    };
    let backend = Arc::new(SymphoniaBackend::new(config.interrupt_poll));
    let player = Player::new(backend, output.sink(), config);
    player.init(args.channels, args.rate, args.bits)?;
    tracing::info!(source = %source, output = %format, "player ready");

    let policy = ReplayPolicy {
        max_plays: args.repeat,
        pause_between: Duration::from_millis(args.pause_between_ms),
        ..ReplayPolicy::default()
    };
    let outcome = replay::run(&player, &source, &policy, &cancel, || output.settle());

    player.finalize()?;
    output.close()?;

    let completed = outcome?;
    tracing::info!(completed, attempts = policy.max_plays, "done");
    Ok(())
}
