//! Progressive HTTP source for network streams.
//!
//! A fetch thread performs the request with `ureq` and pushes body chunks over a
//! bounded channel. The demuxer reads from the receiving side, which waits in
//! short slices and polls the interrupt hook between them, so a stalled socket
//! surfaces as a `TimedOut` error once the watchdog gives up on the read.
//!
//! Socket waits inside `ureq` are sliced the same way by [`ClosableTransport`],
//! so dropping the source stops the fetch thread even while the peer is silent.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use symphonia::core::io::MediaSource;
use ureq::Agent;
use ureq::unversioned::resolver::DefaultResolver;
use ureq::unversioned::transport::{
    Buffers, ConnectionDetails, Connector, DefaultConnector, NextTimeout, Transport,
};

use crate::config::WatchdogTimeouts;
use crate::watchdog::InterruptHook;

const CHUNK_BYTES: usize = 16 * 1024;
const CHANNEL_CHUNKS: usize = 64;

enum FetchEvent {
    Connected { content_length: Option<u64> },
    Data(Vec<u8>),
    End,
    Failed(String),
}

/// Wraps the default transports so every socket wait re-checks `closed`.
#[derive(Debug)]
struct ClosableConnector {
    closed: Arc<AtomicBool>,
    slice: Duration,
}

impl Connector<Box<dyn Transport>> for ClosableConnector {
    type Out = ClosableTransport;

    fn connect(
        &self,
        _details: &ConnectionDetails,
        chained: Option<Box<dyn Transport>>,
    ) -> Result<Option<Self::Out>, ureq::Error> {
        Ok(chained.map(|inner| ClosableTransport {
            inner,
            closed: self.closed.clone(),
            slice: self.slice,
        }))
    }
}

#[derive(Debug)]
struct ClosableTransport {
    inner: Box<dyn Transport>,
    closed: Arc<AtomicBool>,
    slice: Duration,
}

fn is_timeout(e: &ureq::Error) -> bool {
    match e {
        ureq::Error::Timeout(_) => true,
        ureq::Error::Io(err) => matches!(
            err.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        ),
        _ => false,
    }
}

impl Transport for ClosableTransport {
    fn buffers(&mut self) -> &mut dyn Buffers {
        self.inner.buffers()
    }

    fn transmit_output(&mut self, amount: usize, timeout: NextTimeout) -> Result<(), ureq::Error> {
        self.inner.transmit_output(amount, timeout)
    }

    fn await_input(&mut self, timeout: NextTimeout) -> Result<bool, ureq::Error> {
        let deadline = if timeout.after.is_not_happening() {
            None
        } else {
            Instant::now().checked_add(*timeout.after)
        };
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(ureq::Error::Timeout(timeout.reason));
            }
            let mut wait = self.slice;
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(ureq::Error::Timeout(timeout.reason));
                }
                wait = wait.min(left);
            }
            let sliced = NextTimeout {
                after: wait.into(),
                reason: timeout.reason,
            };
            match self.inner.await_input(sliced) {
                Err(e) if is_timeout(&e) => continue,
                other => return other,
            }
        }
    }

    fn is_open(&mut self) -> bool {
        self.inner.is_open()
    }

    fn is_tls(&self) -> bool {
        self.inner.is_tls()
    }
}

fn agent(timeouts: WatchdogTimeouts, closed: Arc<AtomicBool>, slice: Duration) -> Agent {
    let config = Agent::config_builder()
        .timeout_connect(Some(timeouts.open_input))
        .timeout_recv_response(Some(timeouts.open_input))
        .build();
    let connector = DefaultConnector::new().chain(ClosableConnector { closed, slice });
    Agent::with_parts(config, connector, DefaultResolver::default())
}

/// Owns the fetch thread; dropping it closes the transport and joins.
///
/// The join is bounded by one wait slice, or by the connect timeout while the
/// socket is still being opened.
struct FetchThread {
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FetchThread {
    fn spawn(
        url: String,
        agent: Agent,
        closed: Arc<AtomicBool>,
        tx: Sender<FetchEvent>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("http-fetch".to_string())
            .spawn(move || fetch(&url, &agent, &tx))?;
        Ok(Self {
            closed,
            handle: Some(handle),
        })
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for FetchThread {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("http fetch thread panicked");
        }
    }
}

fn fetch(url: &str, agent: &Agent, tx: &Sender<FetchEvent>) {
    let resp = match agent.get(url).call() {
        Ok(resp) => resp,
        Err(e) => {
            let _ = tx.send(FetchEvent::Failed(format!("http request failed: {e}")));
            return;
        }
    };
    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    if tx.send(FetchEvent::Connected { content_length }).is_err() {
        return;
    }

    let (_, body) = resp.into_parts();
    let mut reader = body.into_reader();
    loop {
        let mut chunk = vec![0u8; CHUNK_BYTES];
        let event = match reader.read(&mut chunk) {
            Ok(0) => FetchEvent::End,
            Ok(n) => {
                chunk.truncate(n);
                FetchEvent::Data(chunk)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => FetchEvent::Failed(format!("http read failed: {e}")),
        };
        let last = !matches!(event, FetchEvent::Data(_));
        if tx.send(event).is_err() || last {
            break;
        }
    }
    tracing::debug!(url, "http fetch thread exiting");
}

/// Forward-only reader over an HTTP response body.
pub(crate) struct HttpStreamSource {
    url: String,
    // Declared before `_fetch`: dropping it first wakes a fetch thread blocked on send.
    rx: Receiver<FetchEvent>,
    _fetch: FetchThread,
    hook: InterruptHook,
    poll_interval: Duration,
    content_length: Option<u64>,
    buf: Vec<u8>,
    buf_pos: usize,
    position: u64,
    ended: bool,
}

impl HttpStreamSource {
    /// Issue the request and wait for the response headers.
    ///
    /// The wait is bounded by whatever watchdog category the caller entered.
    pub(crate) fn connect(url: &str, hook: InterruptHook, poll_interval: Duration) -> io::Result<Self> {
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let (tx, rx) = bounded::<FetchEvent>(CHANNEL_CHUNKS);
        let closed = Arc::new(AtomicBool::new(false));
        let agent = agent(hook.timeouts(), closed.clone(), poll_interval);
        let fetch = FetchThread::spawn(url.to_string(), agent, closed, tx)?;

        let content_length = loop {
            match rx.recv_timeout(poll_interval) {
                Ok(FetchEvent::Connected { content_length }) => break content_length,
                Ok(FetchEvent::Failed(msg)) => return Err(io::Error::other(msg)),
                Ok(_) => return Err(io::Error::other("http response arrived without headers")),
                Err(RecvTimeoutError::Timeout) => hook.check()?,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::other("http fetch thread exited"));
                }
            }
        };
        tracing::info!(url, content_length = ?content_length, "http stream connected");

        Ok(Self {
            url: url.to_string(),
            rx,
            _fetch: fetch,
            hook,
            poll_interval,
            content_length,
            buf: Vec::new(),
            buf_pos: 0,
            position: 0,
            ended: false,
        })
    }
}

impl Read for HttpStreamSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.buf_pos < self.buf.len() {
                let n = (self.buf.len() - self.buf_pos).min(out.len());
                out[..n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
                self.buf_pos += n;
                self.position += n as u64;
                return Ok(n);
            }
            if self.ended {
                return Ok(0);
            }
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(FetchEvent::Data(chunk)) => {
                    self.buf = chunk;
                    self.buf_pos = 0;
                }
                Ok(FetchEvent::End) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!(url = %self.url, bytes = self.position, "http stream ended");
                    self.ended = true;
                }
                Ok(FetchEvent::Failed(msg)) => return Err(io::Error::other(msg)),
                Ok(FetchEvent::Connected { .. }) => {}
                Err(RecvTimeoutError::Timeout) => self.hook.check()?,
            }
        }
    }
}

impl Seek for HttpStreamSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.position),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "http stream is not seekable",
            )),
        }
    }
}

impl MediaSource for HttpStreamSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        self.content_length
    }
}
