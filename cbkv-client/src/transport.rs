//! # Transport
//!
//! Purpose: Open byte streams to nodes and apply socket-level tuning before
//! the pool hands them out.
//!
//! ## Design Principles
//! 1. **Trait Seam**: The pool only sees `Transport` and `Socket`, so tests
//!    swap in in-memory streams and count connection attempts.
//! 2. **Tune Before Use**: Keepalive and linger are applied inside
//!    `connect`; a socket is never visible to the pool untuned.
//! 3. **Blocking I/O with Deadlines**: Reads and writes are bounded by
//!    per-call timeouts instead of an event loop. Name lookup and every
//!    resolved address share one connect deadline.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};

/// Socket options applied to every new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketTuning {
    /// `(time to first probe, probe interval)` when keepalive is enabled.
    pub keepalive: Option<(Duration, Duration)>,
    /// Linger-on-close duration when linger is enabled.
    pub linger: Option<Duration>,
}

/// Established byte stream to one node.
pub trait Socket: Read + Write + Send {
    /// Bounds subsequent blocking reads; `None` blocks indefinitely.
    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bounds subsequent blocking writes; `None` blocks indefinitely.
    fn set_send_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Closes both directions.
    fn shutdown(&mut self) -> io::Result<()>;
}

/// Connection factory.
pub trait Transport: Send + Sync {
    /// Connects to `addr` within `timeout` and applies `tuning`.
    ///
    /// A connect that runs out of time fails with `io::ErrorKind::TimedOut`.
    fn connect(&self, addr: &str, timeout: Duration, tuning: &SocketTuning) -> io::Result<Box<dyn Socket>>;
}

/// Plain TCP via `std::net`, tuned through `socket2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect(&self, addr: &str, timeout: Duration, tuning: &SocketTuning) -> io::Result<Box<dyn Socket>> {
        let deadline = Instant::now() + timeout;
        let candidates = resolve(addr, timeout)?;
        let stream = connect_any(addr, &candidates, deadline)?;
        apply_tuning(&stream, tuning)?;
        // Small request frames; Nagle only adds latency.
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpSocket { stream }))
    }
}

/// Resolves `addr`, giving name lookups at most `timeout`.
///
/// Literal addresses skip the lookup. A lookup that overruns is left to
/// finish on its own thread and its answer is dropped.
fn resolve(addr: &str, timeout: Duration) -> io::Result<Vec<SocketAddr>> {
    if let Ok(literal) = addr.parse::<SocketAddr>() {
        return Ok(vec![literal]);
    }

    let (tx, rx) = mpsc::channel();
    let host = addr.to_string();
    thread::Builder::new()
        .name("cbkv-resolve".into())
        .spawn(move || {
            let _ = tx.send(host.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>()));
        })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("resolving {addr} took longer than {timeout:?}"),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("resolver for {addr} exited without an answer"),
        )),
    }
}

/// Tries each candidate in turn; all of them share one deadline.
fn connect_any(addr: &str, candidates: &[SocketAddr], deadline: Instant) -> io::Result<TcpStream> {
    let mut last_err = None;
    for candidate in candidates {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {addr} ran out of time"),
            ));
        }
        match TcpStream::connect_timeout(candidate, remaining) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{addr} resolved to no addresses"))
    }))
}

fn apply_tuning(stream: &TcpStream, tuning: &SocketTuning) -> io::Result<()> {
    let sock = SockRef::from(stream);
    match tuning.keepalive {
        Some((time, interval)) => {
            let keepalive = TcpKeepalive::new().with_time(time);
            #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
            let keepalive = keepalive.with_interval(interval);
            #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
            let _ = interval;
            sock.set_tcp_keepalive(&keepalive)?;
        }
        None => sock.set_keepalive(false)?,
    }
    sock.set_linger(tuning.linger)?;
    Ok(())
}

struct TcpSocket {
    stream: TcpStream,
}

impl Read for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Socket for TcpSocket {
    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn set_send_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}
