//! # Node Health
//!
//! Purpose: Track whether a node may receive new acquisitions, driven only by
//! the node's failure policy.
//!
//! ## Design Principles
//! 1. **Policy Decides, Gate Enforces**: The gate asks the policy what a
//!    failure means and applies the decision; it has no thresholds of its own.
//! 2. **Fail Fast While Dead**: Until `dead_timeout` has elapsed since the
//!    last MarkDead, admission fails without touching the transport.
//! 3. **Exactly One Probe**: After the timeout the first caller gets a
//!    `ProbeGuard`; everyone else keeps failing fast until the probe resolves.
//!    Dropping an unresolved guard re-arms the dead timer.
//!
//! ## Notes
//! - State transitions:
//!   `Alive -MarkSuspect-> Suspect -success-> Alive`,
//!   `Alive|Suspect -MarkDead-> Dead -timeout-> Probing -success-> Alive`,
//!   `Probing -failure-> Dead` (or `Suspect` when the policy says so).

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};
use crate::failure::{FailureDecision, NodeFailurePolicy};
use crate::pool::ConnectionPool;

/// Externally visible health of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeHealth {
    Alive,
    Suspect,
    Dead,
}

/// One server endpoint and its connection pool.
pub struct Node {
    address: String,
    pool: ConnectionPool,
}

impl Node {
    pub fn new(pool: ConnectionPool) -> Self {
        Node {
            address: pool.node().to_string(),
            pool,
        }
    }

    /// `host:port` of the node.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn health(&self) -> NodeHealth {
        self.pool.health()
    }

    /// Time of the most recent reported node failure.
    pub fn last_failure(&self) -> Option<Instant> {
        self.pool.last_failure()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Alive,
    Suspect,
    Dead { since: Instant },
    Probing,
}

struct GateInner {
    state: GateState,
    policy: Box<dyn NodeFailurePolicy>,
    last_failure: Option<Instant>,
}

/// Result of asking the gate for admission.
pub(crate) enum Admission<'a> {
    /// Node is serving.
    Open,
    /// Node was dead long enough; this caller owns the single probe.
    Probe(ProbeGuard<'a>),
}

/// Health gate for one node.
pub(crate) struct HealthGate {
    node: String,
    dead_timeout: Duration,
    inner: Mutex<GateInner>,
}

impl HealthGate {
    pub(crate) fn new(node: impl Into<String>, dead_timeout: Duration, policy: Box<dyn NodeFailurePolicy>) -> Self {
        HealthGate {
            node: node.into(),
            dead_timeout,
            inner: Mutex::new(GateInner {
                state: GateState::Alive,
                policy,
                last_failure: None,
            }),
        }
    }

    pub(crate) fn health(&self) -> NodeHealth {
        match self.inner.lock().state {
            GateState::Alive => NodeHealth::Alive,
            GateState::Suspect => NodeHealth::Suspect,
            GateState::Dead { .. } | GateState::Probing => NodeHealth::Dead,
        }
    }

    pub(crate) fn last_failure(&self) -> Option<Instant> {
        self.inner.lock().last_failure
    }

    /// Admits a caller, hands out the probe, or fails fast with `NodeDead`.
    pub(crate) fn admit(&self) -> ClientResult<Admission<'_>> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            GateState::Alive | GateState::Suspect => Ok(Admission::Open),
            GateState::Dead { since } => {
                let elapsed = since.elapsed();
                if elapsed < self.dead_timeout {
                    return Err(self.dead_error(self.dead_timeout - elapsed));
                }
                inner.state = GateState::Probing;
                debug!(node = %self.node, "dead timeout elapsed; probing node");
                Ok(Admission::Probe(ProbeGuard {
                    gate: self,
                    resolved: false,
                }))
            }
            GateState::Probing => Err(self.dead_error(Duration::ZERO)),
        }
    }

    /// Fails with `NodeDead` while the node is dead or being probed, without
    /// claiming the probe.
    pub(crate) fn ensure_open(&self) -> ClientResult<()> {
        match self.inner.lock().state {
            GateState::Alive | GateState::Suspect => Ok(()),
            GateState::Dead { since } => {
                Err(self.dead_error(self.dead_timeout.saturating_sub(since.elapsed())))
            }
            GateState::Probing => Err(self.dead_error(Duration::ZERO)),
        }
    }

    /// Reports a failure to the policy and applies its decision.
    ///
    /// Errors that are not node failures are ignored. Returns true when the
    /// node just became dead, so the caller can drain idle connections.
    pub(crate) fn report_failure(&self, error: &ClientError) -> bool {
        if !error.is_node_failure() {
            return false;
        }

        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        let decision = inner.policy.on_failure(&self.node, error);
        let previous = inner.state;
        let next = match (decision, previous) {
            (FailureDecision::MarkDead, _) => GateState::Dead { since: Instant::now() },
            // A failed probe leaves the node gated unless the policy softens it.
            (FailureDecision::Ignore, GateState::Probing) => GateState::Dead { since: Instant::now() },
            (FailureDecision::MarkSuspect, _) => GateState::Suspect,
            (FailureDecision::Ignore, state) => state,
        };
        inner.state = next;
        drop(inner);

        match next {
            GateState::Dead { .. } => {
                warn!(
                    node = %self.node,
                    error = %error,
                    dead_for = ?self.dead_timeout,
                    "node marked dead"
                );
                !matches!(previous, GateState::Dead { .. })
            }
            GateState::Suspect if previous != GateState::Suspect => {
                warn!(node = %self.node, error = %error, "node marked suspect");
                false
            }
            _ => {
                debug!(node = %self.node, error = %error, ?decision, "node failure reported");
                false
            }
        }
    }

    /// Reports a success; suspect and probing nodes become alive.
    pub(crate) fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.policy.on_success(&self.node);
        match inner.state {
            GateState::Suspect | GateState::Probing => {
                inner.state = GateState::Alive;
                drop(inner);
                info!(node = %self.node, "node is alive");
            }
            _ => {}
        }
    }

    fn dead_error(&self, retry_in: Duration) -> ClientError {
        ClientError::NodeDead {
            node: self.node.clone(),
            retry_in,
        }
    }
}

/// Ownership of the single post-timeout probe.
pub(crate) struct ProbeGuard<'a> {
    gate: &'a HealthGate,
    resolved: bool,
}

impl ProbeGuard<'_> {
    /// Probe succeeded; the node is alive again.
    pub(crate) fn succeed(mut self) {
        self.resolved = true;
        self.gate.record_success();
    }

    /// Probe failed; the policy decides what happens next.
    pub(crate) fn fail(mut self, error: &ClientError) -> bool {
        self.resolved = true;
        if error.is_node_failure() {
            return self.gate.report_failure(error);
        }
        self.rearm();
        false
    }

    fn rearm(&self) {
        let mut inner = self.gate.inner.lock();
        if inner.state == GateState::Probing {
            inner.state = GateState::Dead { since: Instant::now() };
        }
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.rearm();
            debug!(node = %self.gate.node, "probe abandoned; node stays dead");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::thread;

    use crate::failure::{FailImmediatelyPolicy, ThrottlingFailurePolicy};

    fn io_error() -> ClientError {
        ClientError::io("n1", io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    fn gate(dead_timeout: Duration) -> HealthGate {
        HealthGate::new("n1", dead_timeout, Box::new(FailImmediatelyPolicy))
    }

    #[test]
    fn test_dead_node_fails_fast_then_allows_one_probe() {
        let gate = gate(Duration::from_millis(50));
        assert!(gate.report_failure(&io_error()));
        assert_eq!(gate.health(), NodeHealth::Dead);
        assert!(gate.last_failure().is_some());

        match gate.admit() {
            Err(ClientError::NodeDead { retry_in, .. }) => assert!(retry_in > Duration::ZERO),
            _ => panic!("expected NodeDead"),
        }

        thread::sleep(Duration::from_millis(60));
        let probe = match gate.admit() {
            Ok(Admission::Probe(probe)) => probe,
            _ => panic!("expected probe"),
        };
        assert!(matches!(gate.admit(), Err(ClientError::NodeDead { .. })));
        probe.succeed();
        assert_eq!(gate.health(), NodeHealth::Alive);
        assert!(matches!(gate.admit(), Ok(Admission::Open)));
    }

    #[test]
    fn test_abandoned_probe_rearms_timer() {
        let gate = gate(Duration::from_millis(20));
        gate.report_failure(&io_error());
        thread::sleep(Duration::from_millis(30));
        match gate.admit() {
            Ok(Admission::Probe(probe)) => drop(probe),
            _ => panic!("expected probe"),
        }
        assert!(matches!(gate.admit(), Err(ClientError::NodeDead { .. })));
    }

    #[test]
    fn test_failed_probe_stays_dead() {
        let gate = gate(Duration::from_millis(20));
        gate.report_failure(&io_error());
        thread::sleep(Duration::from_millis(30));
        match gate.admit() {
            Ok(Admission::Probe(probe)) => {
                probe.fail(&io_error());
            }
            _ => panic!("expected probe"),
        }
        assert_eq!(gate.health(), NodeHealth::Dead);
        assert!(matches!(gate.admit(), Err(ClientError::NodeDead { .. })));
    }

    #[test]
    fn test_receive_timeout_is_not_a_node_failure() {
        let gate = gate(Duration::from_secs(1));
        let err = ClientError::ReceiveTimeout {
            node: "n1".into(),
            elapsed: Duration::from_millis(5),
        };
        assert!(!gate.report_failure(&err));
        assert_eq!(gate.health(), NodeHealth::Alive);
    }

    #[test]
    fn test_suspect_recovers_on_success() {
        let gate = HealthGate::new(
            "n1",
            Duration::from_secs(1),
            Box::new(ThrottlingFailurePolicy::new(3, Duration::from_secs(60))),
        );
        assert!(!gate.report_failure(&io_error()));
        assert_eq!(gate.health(), NodeHealth::Suspect);
        assert!(matches!(gate.admit(), Ok(Admission::Open)));
        gate.record_success();
        assert_eq!(gate.health(), NodeHealth::Alive);
    }
}
