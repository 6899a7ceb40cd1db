//! Test doubles: a scripted media backend, a collecting sink, a WAV writer and a
//! one-shot HTTP server.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use crossbeam_channel::{Sender, bounded};

use crate::lock;
use crate::media::{
    AudioDecoder, ChannelLayout, DecodeOutcome, DecodedFrame, InputFormat, MediaBackend,
    MediaInput, Packet, SampleFormat,
};
use crate::sink::PcmSink;
use crate::watchdog::InterruptHook;

pub(crate) const AUDIO_STREAM: u32 = 1;
const FOREIGN_STREAM: u32 = 7;
const STALL_LIMIT: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailPoint {
    Open,
    Probe,
    Decoder,
    /// n-th `read_packet` call, counting from 0.
    Read(usize),
    /// n-th `decode` call, counting from 0.
    Decode(usize),
}

/// Blocking call that waits on the interrupt hook instead of returning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StallPoint {
    Open,
    Probe,
    Read(usize),
}

#[derive(Clone, Debug)]
pub(crate) struct Script {
    pub format: InputFormat,
    pub packets: usize,
    pub packet_bytes: usize,
    pub frames_per_packet: usize,
    pub consume_per_call: Option<usize>,
    /// Read indices that yield a packet of another stream.
    pub foreign_at: Vec<usize>,
    /// From this packet timestamp on, the decoder reports the given format.
    pub switch_after: Option<(u64, InputFormat)>,
    pub fail_at: Option<FailPoint>,
    pub stall_at: Option<StallPoint>,
    pub open_delay: Duration,
    pub read_delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            format: InputFormat {
                channel_layout: ChannelLayout::MONO,
                sample_format: SampleFormat::F32,
                sample_rate: 16_000,
            },
            packets: 4,
            packet_bytes: 64,
            frames_per_packet: 256,
            consume_per_call: None,
            foreign_at: Vec::new(),
            switch_after: None,
            fail_at: None,
            stall_at: None,
            open_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    opens: AtomicUsize,
    reads: AtomicUsize,
    decodes: AtomicUsize,
    live_inputs: AtomicUsize,
    live_decoders: AtomicUsize,
}

impl Counters {
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub(crate) fn live_inputs(&self) -> usize {
        self.live_inputs.load(Ordering::SeqCst)
    }

    pub(crate) fn live_decoders(&self) -> usize {
        self.live_decoders.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedBackend {
    script: Script,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            counters: Arc::new(Counters::default()),
        }
    }

    pub(crate) fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }
}

fn stall(hook: &InterruptHook) -> Result<()> {
    let started = Instant::now();
    while started.elapsed() < STALL_LIMIT {
        hook.check()?;
        thread::sleep(Duration::from_millis(5));
    }
    bail!("stall was never interrupted")
}

impl MediaBackend for ScriptedBackend {
    fn open_input(&self, _source: &str, hook: InterruptHook) -> Result<Box<dyn MediaInput>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if !self.script.open_delay.is_zero() {
            thread::sleep(self.script.open_delay);
        }
        if self.script.stall_at == Some(StallPoint::Open) {
            stall(&hook)?;
        }
        if self.script.fail_at == Some(FailPoint::Open) {
            bail!("scripted open failure");
        }
        self.counters.live_inputs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedInput {
            script: self.script.clone(),
            counters: self.counters.clone(),
            hook,
            read_index: 0,
            audio_sent: 0,
        }))
    }
}

struct ScriptedInput {
    script: Script,
    counters: Arc<Counters>,
    hook: InterruptHook,
    read_index: usize,
    audio_sent: usize,
}

impl Drop for ScriptedInput {
    fn drop(&mut self) {
        self.counters.live_inputs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MediaInput for ScriptedInput {
    fn find_stream_info(&mut self) -> Result<()> {
        if self.script.stall_at == Some(StallPoint::Probe) {
            stall(&self.hook)?;
        }
        if self.script.fail_at == Some(FailPoint::Probe) {
            bail!("scripted probe failure");
        }
        Ok(())
    }

    fn open_best_audio_decoder(&mut self) -> Result<(u32, Box<dyn AudioDecoder>)> {
        if self.script.fail_at == Some(FailPoint::Decoder) {
            bail!("scripted decoder failure");
        }
        self.counters.live_decoders.fetch_add(1, Ordering::SeqCst);
        Ok((
            AUDIO_STREAM,
            Box::new(ScriptedDecoder {
                script: self.script.clone(),
                counters: self.counters.clone(),
            }),
        ))
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let index = self.read_index;
        self.read_index += 1;
        self.counters.reads.fetch_add(1, Ordering::SeqCst);

        if !self.script.read_delay.is_zero() {
            thread::sleep(self.script.read_delay);
        }
        if self.script.stall_at == Some(StallPoint::Read(index)) {
            stall(&self.hook)?;
        }
        if self.script.fail_at == Some(FailPoint::Read(index)) {
            bail!("scripted read failure");
        }
        if self.script.foreign_at.contains(&index) {
            return Ok(Some(Packet {
                stream: FOREIGN_STREAM,
                ts: index as u64,
                data: vec![0u8; 16].into_boxed_slice(),
            }));
        }
        if self.audio_sent >= self.script.packets {
            return Ok(None);
        }
        let ts = self.audio_sent as u64;
        self.audio_sent += 1;
        Ok(Some(Packet {
            stream: AUDIO_STREAM,
            ts,
            data: vec![0xAB; self.script.packet_bytes].into_boxed_slice(),
        }))
    }
}

struct ScriptedDecoder {
    script: Script,
    counters: Arc<Counters>,
}

impl Drop for ScriptedDecoder {
    fn drop(&mut self) {
        self.counters.live_decoders.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AudioDecoder for ScriptedDecoder {
    fn input_format(&self) -> InputFormat {
        self.script.format
    }

    fn decode(&mut self, ts: u64, data: &[u8], frame: &mut DecodedFrame) -> Result<DecodeOutcome> {
        let index = self.counters.decodes.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_at == Some(FailPoint::Decode(index)) {
            bail!("scripted decode failure");
        }

        let format = match self.script.switch_after {
            Some((from, switched)) if ts >= from => switched,
            _ => self.script.format,
        };
        let frames = self.script.frames_per_packet;
        frame.format = Some(format);
        frame.frames = frames;
        frame.samples.clear();
        frame.samples.resize(frames * format.channels(), 0.25);

        let consumed = self
            .script
            .consume_per_call
            .map_or(data.len(), |n| n.min(data.len()));
        Ok(DecodeOutcome {
            consumed,
            got_frame: true,
        })
    }
}

/// Sink that keeps every buffer it receives.
#[derive(Default)]
pub(crate) struct CollectingSink {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl CollectingSink {
    pub(crate) fn buffers(&self) -> Vec<Vec<u8>> {
        lock(&self.buffers).clone()
    }

    pub(crate) fn buffer_count(&self) -> usize {
        lock(&self.buffers).len()
    }

    pub(crate) fn total_bytes(&self) -> usize {
        lock(&self.buffers).iter().map(Vec::len).sum()
    }
}

impl PcmSink for CollectingSink {
    fn write(&self, pcm: &[u8]) -> usize {
        lock(&self.buffers).push(pcm.to_vec());
        pcm.len()
    }
}

/// 16-bit PCM WAV bytes holding a quiet sine tone.
pub(crate) fn wav_bytes(channels: u16, rate: u32, frames: usize) -> Vec<u8> {
    let block_align = channels * 2;
    let data_len = (frames * block_align as usize) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        let v = ((i as f32 * 0.03).sin() * 8000.0) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

pub(crate) fn write_wav(path: &Path, channels: u16, rate: u32, frames: usize) {
    std::fs::write(path, wav_bytes(channels, rate, frames)).unwrap();
}

/// Unique path in the temp dir for one test.
pub(crate) fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("stream-player-{}-{name}", std::process::id()))
}

/// HTTP server answering exactly one request.
///
/// With `stall_after`, only that many body bytes are sent and the connection is
/// then held open until the server is dropped.
pub(crate) struct OneShotServer {
    pub url: String,
    release: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl OneShotServer {
    pub(crate) fn start(body: Vec<u8>, stall_after: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/tone.wav", listener.local_addr().unwrap());
        let (release_tx, release_rx) = bounded::<()>(1);

        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }

            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: audio/wav\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes());
            let sent = stall_after.map_or(body.len(), |n| n.min(body.len()));
            let _ = stream.write_all(&body[..sent]);
            let _ = stream.flush();
            if stall_after.is_some() {
                let _ = release_rx.recv_timeout(STALL_LIMIT);
            }
        });

        Self {
            url,
            release: Some(release_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for OneShotServer {
    fn drop(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.is_finished()
        {
            let _ = handle.join();
        }
    }
}
