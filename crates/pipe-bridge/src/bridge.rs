//! The copy loop.
//!
//! One thread multiplexes four descriptors with `poll(2)`: stdin and the
//! outbound pipe for reading, stdout and the inbound pipe for writing. Each
//! direction waits on exactly one of its two descriptors per round: the source
//! while idle, the sink while a chunk is held. Each direction owns one chunk
//! buffer, so no more than [`CHUNK_SIZE`] bytes are
//! ever in flight per direction. Backpressure is left to the kernel's pipe
//! buffers and to the configured [`WritePolicy`].

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::ops::Range;
use std::os::fd::AsFd;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, CHUNK_SIZE, WritePolicy};
use crate::error::{BridgeError, Result};
use crate::fifo;
use crate::stdio;

/// One of the four descriptors the bridge drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Stdin,
    Stdout,
    /// FIFO that receives stdin.
    PipeIn,
    /// FIFO whose contents go to stdout.
    PipeOut,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::PipeIn => write!(f, "pipe-in"),
            Self::PipeOut => write!(f, "pipe-out"),
        }
    }
}

/// A copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// stdin -> pipe-in
    Upstream,
    /// pipe-out -> stdout
    Downstream,
}

impl Direction {
    pub const fn source(self) -> Endpoint {
        match self {
            Self::Upstream => Endpoint::Stdin,
            Self::Downstream => Endpoint::PipeOut,
        }
    }

    pub const fn sink(self) -> Endpoint {
        match self {
            Self::Upstream => Endpoint::PipeIn,
            Self::Downstream => Endpoint::Stdout,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.sink())
    }
}

/// The descriptors a [`Bridge`] owns for one run.
///
/// All four must already be in non-blocking mode.
#[derive(Debug)]
pub struct Endpoints {
    pub stdin: File,
    pub stdout: File,
    pub pipe_in: File,
    pub pipe_out: File,
}

/// Per-direction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes written to the sink.
    pub bytes: u64,
    /// Chunks written to the sink in full.
    pub chunks: u64,
    /// Chunks (or chunk tails) discarded because the sink would block.
    pub dropped_chunks: u64,
    pub dropped_bytes: u64,
}

/// Why the copy loop ended.
#[derive(Debug)]
pub enum StopReason {
    /// The cancellation token fired (SIGINT/SIGTERM).
    Cancelled,
    /// stdin reached end of stream.
    InputClosed,
    /// The writer on pipe-out went away.
    PeerClosed,
    /// A read, write or poll failed, or a descriptor reported an error.
    Failed(BridgeError),
}

impl StopReason {
    pub const fn is_graceful(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "shutdown requested"),
            Self::InputClosed => write!(f, "stdin closed"),
            Self::PeerClosed => write!(f, "pipe-out closed by peer"),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Outcome of [`Bridge::run`].
#[derive(Debug)]
pub struct BridgeReport {
    pub reason: StopReason,
    pub upstream: TransferStats,
    pub downstream: TransferStats,
    /// Number of `poll(2)` rounds the loop ran.
    pub polls: u64,
}

/// Readiness bits that mean "try a read": data, or a hang-up whose read
/// will report end of stream.
const READABLE: PollFlags = PollFlags::POLLIN.union(PollFlags::POLLHUP);
/// Readiness bits that mean "try the pending write": room, or a condition the
/// write itself will turn into an error.
const WRITABLE: PollFlags = PollFlags::POLLOUT
    .union(PollFlags::POLLERR)
    .union(PollFlags::POLLHUP);
const FAULT: PollFlags = PollFlags::POLLERR.union(PollFlags::POLLNVAL);

enum Fill {
    Data,
    Eof,
    NotReady,
}

/// One direction: a chunk buffer plus the range still owed to the sink.
struct Lane {
    direction: Direction,
    buf: Box<[u8]>,
    pending: Range<usize>,
    stats: TransferStats,
}

impl Lane {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            buf: vec![0; CHUNK_SIZE].into_boxed_slice(),
            pending: 0..0,
            stats: TransferStats::default(),
        }
    }

    const fn is_holding(&self) -> bool {
        self.pending.start < self.pending.end
    }

    /// The one descriptor this lane waits on: the sink while a chunk is held,
    /// the source otherwise.
    ///
    /// `poll(2)` reports hang-up and error on every registered descriptor
    /// whatever its requested events, so a descriptor nothing would act on
    /// must stay out of the set.
    fn watch<'fd>(&self, source: &'fd File, sink: &'fd File) -> PollFd<'fd> {
        if self.is_holding() {
            PollFd::new(sink.as_fd(), PollFlags::POLLOUT)
        } else {
            PollFd::new(source.as_fd(), PollFlags::POLLIN)
        }
    }

    fn fill(&mut self, reader: &mut File) -> Result<Fill> {
        loop {
            match reader.read(&mut self.buf) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    self.pending = 0..n;
                    return Ok(Fill::Data);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::NotReady),
                Err(source) => {
                    return Err(BridgeError::Read {
                        endpoint: self.direction.source(),
                        source,
                    });
                }
            }
        }
    }

    /// Write the held range to `sink` until it is gone or the sink is full.
    fn flush(&mut self, sink: &mut File, policy: WritePolicy) -> Result<()> {
        while self.is_holding() {
            match sink.write(&self.buf[self.pending.clone()]) {
                Ok(0) => {
                    return Err(BridgeError::Write {
                        endpoint: self.direction.sink(),
                        source: io::ErrorKind::WriteZero.into(),
                    });
                }
                Ok(n) => {
                    self.pending.start += n;
                    self.stats.bytes += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.on_full(policy);
                    return Ok(());
                }
                Err(source) => {
                    return Err(BridgeError::Write {
                        endpoint: self.direction.sink(),
                        source,
                    });
                }
            }
        }
        self.stats.chunks += 1;
        Ok(())
    }

    fn on_full(&mut self, policy: WritePolicy) {
        let held = self.pending.len();
        match policy {
            WritePolicy::Drop => {
                self.stats.dropped_chunks += 1;
                self.stats.dropped_bytes += held as u64;
                self.pending = 0..0;
                debug!(direction = %self.direction, bytes = held, "Sink full, chunk dropped");
            }
            WritePolicy::Retry => {
                debug!(direction = %self.direction, bytes = held, "Sink full, holding chunk");
            }
        }
    }
}

/// Bidirectional relay between stdio and a pair of FIFOs.
pub struct Bridge {
    endpoints: Endpoints,
    config: BridgeConfig,
    upstream: Lane,
    downstream: Lane,
    polls: u64,
}

impl Bridge {
    /// Wrap already-open, non-blocking endpoints.
    pub fn new(endpoints: Endpoints, config: BridgeConfig) -> Self {
        Self {
            endpoints,
            config,
            upstream: Lane::new(Direction::Upstream),
            downstream: Lane::new(Direction::Downstream),
            polls: 0,
        }
    }

    /// Run the setup sequence against two FIFO paths.
    ///
    /// Creates both FIFOs if absent, opens `pipe_in` for writing (waiting for
    /// a reader if none is attached), opens `pipe_out` for reading without
    /// waiting, and switches stdin/stdout to non-blocking mode. Any handle
    /// opened before a failure is closed on return.
    pub fn open(pipe_in: &Path, pipe_out: &Path, config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        fifo::ensure_fifo(pipe_in)?;
        fifo::ensure_fifo(pipe_out)?;

        let (pipe_in_file, how) = fifo::open_writer(pipe_in)?;
        debug!(path = %pipe_in.display(), ?how, "Opened pipe-in");
        let pipe_out_file = fifo::open_reader(pipe_out)?;
        let (stdin, stdout) = stdio::take_nonblocking()?;

        info!(
            pipe_in = %pipe_in.display(),
            pipe_out = %pipe_out.display(),
            "Pipe bridge started. stdin -> {}, {} -> stdout",
            pipe_in.display(),
            pipe_out.display()
        );
        info!("Press Ctrl+C to stop.");

        Ok(Self::new(
            Endpoints {
                stdin,
                stdout,
                pipe_in: pipe_in_file,
                pipe_out: pipe_out_file,
            },
            config,
        ))
    }

    /// Copy in both directions until cancelled, a source closes, or an I/O
    /// error occurs. Consumes the bridge: both pipe handles are closed before
    /// this returns.
    pub fn run(mut self, cancel: &CancellationToken) -> BridgeReport {
        debug!(
            poll_interval = ?self.config.poll_interval,
            on_full = %self.config.on_full,
            "Entering copy loop"
        );

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            match self.step() {
                Ok(None) => {}
                Ok(Some(reason)) => break reason,
                Err(err) => {
                    error!("{err}");
                    break StopReason::Failed(err);
                }
            }
        };

        let Self {
            endpoints,
            upstream,
            downstream,
            polls,
            ..
        } = self;
        drop(endpoints);

        let dropped = upstream.stats.dropped_chunks + downstream.stats.dropped_chunks;
        if dropped > 0 {
            warn!(
                dropped_chunks = dropped,
                dropped_bytes = upstream.stats.dropped_bytes + downstream.stats.dropped_bytes,
                "Chunks were dropped because a sink was full"
            );
        }
        info!(
            reason = %reason,
            upstream_bytes = upstream.stats.bytes,
            downstream_bytes = downstream.stats.bytes,
            polls,
            "Pipe bridge stopped."
        );

        BridgeReport {
            reason,
            upstream: upstream.stats,
            downstream: downstream.stats,
            polls,
        }
    }

    /// One poll-and-dispatch round. `Ok(Some(_))` asks the loop to stop.
    fn step(&mut self) -> Result<Option<StopReason>> {
        let Self {
            endpoints,
            config,
            upstream,
            downstream,
            polls,
        } = self;

        let [up_ev, down_ev] = {
            let mut fds = [
                upstream.watch(&endpoints.stdin, &endpoints.pipe_in),
                downstream.watch(&endpoints.pipe_out, &endpoints.stdout),
            ];
            *polls += 1;
            match poll(&mut fds, poll_timeout(config.poll_interval)) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(None),
                Err(errno) => return Err(BridgeError::Poll(errno.into())),
            }
            fds.map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
        };
        let mut stop = None;

        if upstream.is_holding() {
            if up_ev.intersects(WRITABLE) {
                upstream.flush(&mut endpoints.pipe_in, config.on_full)?;
            }
        } else {
            check_source(Endpoint::Stdin, up_ev)?;
            if up_ev.intersects(READABLE) {
                match upstream.fill(&mut endpoints.stdin)? {
                    Fill::Data => upstream.flush(&mut endpoints.pipe_in, config.on_full)?,
                    Fill::Eof => {
                        info!("stdin reached end of stream");
                        stop = Some(StopReason::InputClosed);
                    }
                    Fill::NotReady => {}
                }
            }
        }

        if downstream.is_holding() {
            if down_ev.intersects(WRITABLE) {
                downstream.flush(&mut endpoints.stdout, config.on_full)?;
            }
        } else {
            check_source(Endpoint::PipeOut, down_ev)?;
            if down_ev.intersects(READABLE) {
                match downstream.fill(&mut endpoints.pipe_out)? {
                    Fill::Data => downstream.flush(&mut endpoints.stdout, config.on_full)?,
                    Fill::Eof => {
                        warn!("Pipe-out closed by peer");
                        stop = stop.or(Some(StopReason::PeerClosed));
                    }
                    Fill::NotReady => {}
                }
            }
        }

        Ok(stop)
    }
}

/// An error condition on a source descriptor ends the run.
fn check_source(endpoint: Endpoint, revents: PollFlags) -> Result<()> {
    if revents.intersects(FAULT) {
        return Err(BridgeError::Fault(endpoint));
    }
    Ok(())
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    u16::try_from(interval.as_millis()).map_or(PollTimeout::MAX, PollTimeout::from)
}
