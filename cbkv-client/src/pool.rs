//! # Connection Pool
//!
//! Purpose: Lease per-node connections under a size bound and a queue
//! deadline, and route node failures through the node's failure policy.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A bounded set of reusable connections per node;
//!    `total` (idle + leased) never exceeds `max_pool_size`.
//! 2. **Single Lock Discipline**: The idle queue, the live count and the
//!    closed flag change together under one mutex. Connects and socket I/O
//!    run outside it.
//! 3. **Bounded Waiting**: Callers that find the pool full park on a condvar
//!    until `queue_timeout`; every release or freed slot wakes one waiter and
//!    waiters re-check the idle queue after any wakeup, timeouts included.
//! 4. **RAII Leases**: `PooledConnection` returns its connection on drop, or
//!    destroys it when it saw a transport or framing error, when the node is
//!    no longer alive, or when the pool is closed.
//! 5. **Health Gating**: Acquisition asks the node's `HealthGate` first, so a
//!    dead node fails fast without a connection attempt.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use cbkv_common::{decode_frame, RESPONSE_MAGIC};

use crate::config::{ConfigError, ConnectionPoolConfig};
use crate::error::{ClientError, ClientResult};
use crate::failure;
use crate::node::{Admission, HealthGate, NodeHealth, ProbeGuard};
use crate::operation::Operation;
use crate::response::Response;
use crate::stats::{PoolStats, PoolStatsSnapshot};
use crate::transport::{Socket, SocketTuning, Transport};

const READ_CHUNK: usize = 16 * 1024;

/// Sockets reject a zero timeout.
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    node: String,
    config: ConnectionPoolConfig,
    tuning: SocketTuning,
    transport: Arc<dyn Transport>,
    gate: HealthGate,
    state: Mutex<PoolState>,
    available: Condvar,
    stats: PoolStats,
    next_id: AtomicU64,
}

/// Connection pool for one node. Cloning shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool for `node`.
    ///
    /// # Errors
    /// `ConfigError` when `config` violates its invariants.
    pub fn new(
        node: impl Into<String>,
        config: ConnectionPoolConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let node = node.into();
        let policy = failure::policy_for(config.failure_policy.as_ref(), &node);
        debug!(node = %node, policy = policy.name(), max = config.max_pool_size, "creating connection pool");

        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                gate: HealthGate::new(node.clone(), config.dead_timeout, policy),
                tuning: config.socket_tuning(),
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(config.max_pool_size),
                    total: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                stats: PoolStats::new(),
                next_id: AtomicU64::new(1),
                node,
                config,
                transport,
            }),
        })
    }

    /// Node address this pool connects to.
    pub fn node(&self) -> &str {
        &self.inner.node
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.inner.config
    }

    pub fn health(&self) -> NodeHealth {
        self.inner.gate.health()
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.inner.gate.last_failure()
    }

    /// Leases a connection.
    ///
    /// Returns an idle connection if one exists, otherwise opens a new one
    /// while below `max_pool_size`, otherwise waits up to `queue_timeout`.
    ///
    /// # Errors
    /// - `NodeDead` while the node is gated (no connection attempt is made).
    /// - `ConnectTimeout` / `Io` when opening a connection fails.
    /// - `PoolExhausted` when nothing became available in time.
    /// - `PoolClosed` after `close`.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        let started = Instant::now();
        let admission = match self.inner.gate.admit() {
            Ok(admission) => admission,
            Err(err) => {
                self.inner.stats.record_rejected_dead();
                return Err(err);
            }
        };
        if let Admission::Probe(probe) = admission {
            return self.acquire_probe(probe, started);
        }

        let deadline = started + self.inner.config.queue_timeout;
        let mut queued = false;
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(self.closed_error());
            }
            if let Some(conn) = state.idle.pop_front() {
                drop(state);
                return Ok(self.lease(conn, started, queued));
            }
            if state.total < self.inner.config.max_pool_size {
                state.total += 1;
                drop(state);
                return self.establish(started, queued, None);
            }
            if Instant::now() >= deadline {
                let waited = started.elapsed();
                drop(state);
                self.inner.stats.record_exhausted();
                warn!(node = %self.inner.node, ?waited, "connection pool exhausted");
                return Err(ClientError::PoolExhausted {
                    node: self.inner.node.clone(),
                    waited,
                });
            }

            queued = true;
            // Any wakeup, including a timeout, loops back to the idle check.
            let _ = self.inner.available.wait_until(&mut state, deadline);
            if let Err(err) = self.inner.gate.ensure_open() {
                self.inner.stats.record_rejected_dead();
                return Err(err);
            }
        }
    }

    /// Leases a connection and runs one request/response exchange on it.
    pub fn execute(&self, op: &Operation) -> ClientResult<Response> {
        let mut conn = self.acquire()?;
        conn.execute(op)
    }

    /// Opens connections until `min_pool_size` exist; returns how many were
    /// opened.
    ///
    /// # Errors
    /// The first connect failure, after reporting it to the failure policy.
    pub fn warm_up(&self) -> ClientResult<usize> {
        self.inner.gate.ensure_open()?;
        let target = self.inner.config.min_pool_size;
        let mut opened = 0;
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(self.closed_error());
                }
                if state.total >= target {
                    break;
                }
                state.total += 1;
            }

            match self.inner.connect() {
                Ok(conn) => {
                    self.inner.gate.record_success();
                    self.inner.push_idle(conn);
                    opened += 1;
                }
                Err(err) => {
                    self.inner.release_slot();
                    self.inner.report_failure(&err);
                    return Err(err);
                }
            }
        }
        info!(node = %self.inner.node, opened, "connection pool warmed up");
        Ok(opened)
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        let (open, idle) = {
            let state = self.inner.state.lock();
            (state.total, state.idle.len())
        };
        self.inner.stats.snapshot(open, idle)
    }

    /// Closes idle connections and refuses further acquisitions. Leased
    /// connections are destroyed when released.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        self.inner.available.notify_all();
        info!(node = %self.inner.node, closed = drained.len(), "connection pool closed");
        for conn in drained {
            self.inner.destroy(conn);
        }
    }

    fn acquire_probe(&self, probe: ProbeGuard<'_>, started: Instant) -> ClientResult<PooledConnection> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            if state.total >= self.inner.config.max_pool_size {
                // Dropping the guard re-arms the dead timer.
                return Err(ClientError::PoolExhausted {
                    node: self.inner.node.clone(),
                    waited: started.elapsed(),
                });
            }
            state.total += 1;
        }
        info!(node = %self.inner.node, "probing dead node");
        self.establish(started, false, Some(probe))
    }

    /// Opens a connection for an already-reserved slot.
    fn establish(&self, started: Instant, queued: bool, probe: Option<ProbeGuard<'_>>) -> ClientResult<PooledConnection> {
        match self.inner.connect() {
            Ok(conn) => {
                match probe {
                    Some(probe) => probe.succeed(),
                    None => self.inner.gate.record_success(),
                }
                Ok(self.lease(conn, started, queued))
            }
            Err(err) => {
                self.inner.release_slot();
                let died = match probe {
                    Some(probe) => probe.fail(&err),
                    None => self.inner.gate.report_failure(&err),
                };
                if died {
                    self.inner.drain_idle();
                }
                Err(err)
            }
        }
    }

    fn lease(&self, conn: Connection, started: Instant, queued: bool) -> PooledConnection {
        self.inner.stats.record_acquire(started.elapsed(), queued);
        PooledConnection {
            pool: self.inner.clone(),
            conn: Some(conn),
            valid: true,
        }
    }

    fn closed_error(&self) -> ClientError {
        ClientError::PoolClosed {
            node: self.inner.node.clone(),
        }
    }
}

impl PoolInner {
    fn connect(&self) -> ClientResult<Connection> {
        let started = Instant::now();
        let timeout = self.config.connection_timeout;
        match self.transport.connect(&self.node, timeout, &self.tuning) {
            Ok(socket) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.stats.record_connect();
                debug!(node = %self.node, conn = id, elapsed = ?started.elapsed(), "connection established");
                Ok(Connection::new(id, socket))
            }
            Err(err) => {
                self.stats.record_connect_failure();
                let elapsed = started.elapsed();
                if err.kind() == io::ErrorKind::TimedOut || elapsed >= timeout {
                    Err(ClientError::ConnectTimeout {
                        node: self.node.clone(),
                        elapsed,
                    })
                } else {
                    Err(ClientError::io(&self.node, err))
                }
            }
        }
    }

    fn push_idle(&self, conn: Connection) {
        self.state.lock().idle.push_back(conn);
        self.available.notify_one();
    }

    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
        }
        self.available.notify_one();
    }

    fn return_connection(&self, conn: Connection, valid: bool) {
        let healthy = valid && self.gate.health() == NodeHealth::Alive;
        let rejected = {
            let mut state = self.state.lock();
            if healthy && !state.closed {
                state.idle.push_back(conn);
                None
            } else {
                state.total = state.total.saturating_sub(1);
                Some(conn)
            }
        };
        self.available.notify_one();
        if let Some(conn) = rejected {
            self.destroy(conn);
        }
    }

    fn report_failure(&self, err: &ClientError) {
        if self.gate.report_failure(err) {
            self.drain_idle();
        }
    }

    /// Destroys every idle connection and wakes all waiters so they observe
    /// the node's new health.
    fn drain_idle(&self) {
        let drained: Vec<Connection> = {
            let mut state = self.state.lock();
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        self.available.notify_all();
        if !drained.is_empty() {
            debug!(node = %self.node, count = drained.len(), "drained idle connections");
        }
        for conn in drained {
            self.destroy(conn);
        }
    }

    fn destroy(&self, mut conn: Connection) {
        self.stats.record_destroyed();
        let _ = conn.socket.shutdown();
        debug!(
            node = %self.node,
            conn = conn.id,
            age = ?conn.created_at.elapsed(),
            "connection destroyed"
        );
    }
}

/// RAII lease; returns the connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    /// Writes `op` and waits for the response carrying its correlation id.
    ///
    /// The wait is bounded by the smaller of the operation timeout and the
    /// pool's `receive_timeout`. A receive timeout leaves the connection
    /// usable; transport and framing errors invalidate it and are reported
    /// to the node's failure policy.
    pub fn execute(&mut self, op: &Operation) -> ClientResult<Response> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(ClientError::PoolClosed {
                node: self.pool.node.clone(),
            });
        };
        let timeout = op.timeout().min(self.pool.config.receive_timeout);
        let result = conn.execute(op, timeout, &self.pool.node, &self.pool.stats);
        match &result {
            Ok(_) => self.pool.gate.record_success(),
            Err(err) if err.is_node_failure() => {
                self.valid = false;
                self.pool.report_failure(err);
            }
            Err(ClientError::ReceiveTimeout { elapsed, .. }) => {
                debug!(
                    node = %self.pool.node,
                    opaque = op.correlation_id(),
                    ?elapsed,
                    "receive timed out; connection kept"
                );
            }
            Err(_) => {}
        }
        result
    }

    /// Marks the connection as unusable; it is destroyed on drop.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Pool-unique id of the leased connection.
    pub fn connection_id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |conn| conn.id)
    }

    /// Time since the connection was last used for a round-trip.
    pub fn idle_for(&self) -> Duration {
        self.conn
            .as_ref()
            .map_or(Duration::ZERO, |conn| conn.last_used.elapsed())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn, self.valid);
        }
    }
}

/// One established connection with its read and write buffers.
///
/// Partially received frames stay in `read_buf` across calls, so a response
/// that arrives after a receive timeout is decoded (and discarded) on the
/// next exchange instead of corrupting the stream.
struct Connection {
    id: u64,
    socket: Box<dyn Socket>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    created_at: Instant,
    last_used: Instant,
}

impl Connection {
    fn new(id: u64, socket: Box<dyn Socket>) -> Self {
        let now = Instant::now();
        Connection {
            id,
            socket,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(256),
            created_at: now,
            last_used: now,
        }
    }

    fn execute(&mut self, op: &Operation, timeout: Duration, node: &str, stats: &PoolStats) -> ClientResult<Response> {
        // Encode failures stay local and never reach the failure policy.
        self.write_buf.clear();
        op.encode(&mut self.write_buf)
            .map_err(|err| ClientError::InvalidArgument(err.to_string()))?;

        self.socket
            .set_send_timeout(Some(timeout.max(MIN_SOCKET_TIMEOUT)))
            .and_then(|_| self.socket.write_all(&self.write_buf))
            .and_then(|_| self.socket.flush())
            .map_err(|err| ClientError::io(node, err))?;

        let started = Instant::now();
        let deadline = started + timeout;
        let expected = op.correlation_id();
        loop {
            while let Some(frame) = decode_frame(&mut self.read_buf, RESPONSE_MAGIC)? {
                if frame.opaque() == expected {
                    self.last_used = Instant::now();
                    return Ok(Response::from_frame(frame));
                }
                stats.record_stale_response();
                debug!(
                    node = %node,
                    conn = self.id,
                    expected,
                    got = frame.opaque(),
                    "discarding response for another request"
                );
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::ReceiveTimeout {
                    node: node.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            self.socket
                .set_receive_timeout(Some(deadline - now))
                .map_err(|err| ClientError::io(node, err))?;
            self.fill(node)?;
        }
    }

    /// Reads whatever is available into the read buffer. Timeouts and
    /// interrupts return without data so the caller can re-check its
    /// deadline.
    fn fill(&mut self, node: &str) -> ClientResult<()> {
        let mut chunk = [0u8; READ_CHUNK];
        match self.socket.read(&mut chunk) {
            Ok(0) => Err(ClientError::io(
                node,
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by node"),
            )),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(ClientError::io(node, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque as Queue;
    use std::io::Cursor;

    use bytes::Bytes;
    use cbkv_common::{ResponseFrame, Status, VBucketId};

    use crate::mapping::Route;
    use crate::sequence::SequenceGenerator;

    /// Socket that replays canned bytes and records writes.
    struct ScriptedSocket {
        reads: Queue<io::Result<Vec<u8>>>,
        written: Arc<Mutex<Vec<u8>>>,
        send_timeout: Arc<Mutex<Option<Duration>>>,
        stalled: bool,
    }

    impl Read for ScriptedSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(bytes)) => Cursor::new(bytes).read(buf),
                Some(Err(err)) => Err(err),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    impl Write for ScriptedSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.stalled {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Socket for ScriptedSocket {
        fn set_receive_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn set_send_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
            *self.send_timeout.lock() = timeout;
            Ok(())
        }

        fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn reply(opaque: u32) -> Vec<u8> {
        let mut out = BytesMut::new();
        ResponseFrame::status_only(0x0a, Status::Success, opaque)
            .encode(&mut out)
            .unwrap();
        out.to_vec()
    }

    fn noop(seq: &SequenceGenerator) -> Operation {
        let route = Route {
            node: 0,
            vbucket: VBucketId(0),
        };
        Operation::noop(seq, route, Duration::from_millis(50)).unwrap()
    }

    fn connection(reads: Vec<io::Result<Vec<u8>>>) -> (Connection, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let socket = ScriptedSocket {
            reads: reads.into(),
            written: written.clone(),
            send_timeout: Arc::new(Mutex::new(None)),
            stalled: false,
        };
        (Connection::new(1, Box::new(socket)), written)
    }

    #[test]
    fn test_stale_responses_are_discarded() {
        let seq = SequenceGenerator::new();
        let op = noop(&seq);
        let mut stream = reply(op.correlation_id().wrapping_add(100));
        stream.extend(reply(op.correlation_id()));
        let (mut conn, written) = connection(vec![Ok(stream)]);

        let stats = PoolStats::new();
        let response = conn.execute(&op, Duration::from_millis(50), "n1", &stats).unwrap();
        assert_eq!(response.correlation_id(), op.correlation_id());
        assert_eq!(stats.snapshot(0, 0).stale_responses, 1);
        assert_eq!(Bytes::from(written.lock().clone()), op.to_bytes().unwrap());
    }

    #[test]
    fn test_partial_frame_survives_receive_timeout() {
        let seq = SequenceGenerator::new();
        let first = noop(&seq);
        let second = noop(&seq);

        let late = reply(first.correlation_id());
        let (head, tail) = late.split_at(10);
        let mut rest = tail.to_vec();
        rest.extend(reply(second.correlation_id()));
        let (mut conn, _) = connection(vec![Ok(head.to_vec())]);

        let stats = PoolStats::new();
        let err = conn.execute(&first, Duration::from_millis(20), "n1", &stats).unwrap_err();
        assert!(matches!(err, ClientError::ReceiveTimeout { .. }));
        assert_eq!(conn.read_buf.len(), 10);

        let (mut fresh, _) = connection(vec![Ok(rest)]);
        fresh.read_buf = conn.read_buf.split();
        let response = fresh.execute(&second, Duration::from_millis(50), "n1", &stats).unwrap();
        assert_eq!(response.correlation_id(), second.correlation_id());
        assert_eq!(stats.snapshot(0, 0).stale_responses, 1);
    }

    #[test]
    fn test_eof_is_io_error() {
        let seq = SequenceGenerator::new();
        let (mut conn, _) = connection(vec![Ok(Vec::new())]);
        let err = conn
            .execute(&noop(&seq), Duration::from_millis(50), "n1", &PoolStats::new())
            .unwrap_err();
        assert!(matches!(err, ClientError::Io { .. }));
        assert!(err.is_node_failure());
    }

    #[test]
    fn test_bad_magic_is_protocol_error() {
        let seq = SequenceGenerator::new();
        let mut garbage = reply(1);
        garbage[0] = 0x80;
        let (mut conn, _) = connection(vec![Ok(garbage)]);
        let err = conn
            .execute(&noop(&seq), Duration::from_millis(50), "n1", &PoolStats::new())
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn test_stalled_write_is_bounded_and_typed() {
        let seq = SequenceGenerator::new();
        let send_timeout = Arc::new(Mutex::new(None));
        let socket = ScriptedSocket {
            reads: Queue::new(),
            written: Arc::new(Mutex::new(Vec::new())),
            send_timeout: send_timeout.clone(),
            stalled: true,
        };
        let mut conn = Connection::new(1, Box::new(socket));

        let err = conn
            .execute(&noop(&seq), Duration::from_millis(40), "n1", &PoolStats::new())
            .unwrap_err();
        assert!(matches!(err, ClientError::Io { .. }));
        assert!(err.is_node_failure());
        assert_eq!(*send_timeout.lock(), Some(Duration::from_millis(40)));
    }
}
