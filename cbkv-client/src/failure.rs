//! # Node Failure Policies
//!
//! Purpose: Decide what a node-level failure means for the node's health.
//! The transport layer decides *whether* something is a failure
//! (`ClientError::is_node_failure`); a policy decides *what to do* about it.
//!
//! ## Design Principles
//! 1. **Capability Trait**: `NodeFailurePolicy` returns a `FailureDecision`;
//!    it never touches the pool directly.
//! 2. **Per-Node Instance**: Each node gets its own policy from the factory,
//!    so stateful policies (throttling) count per node.
//! 3. **Explicit Default**: A factory may decline by returning `None`; the
//!    pool then falls back to `FailImmediatelyPolicy`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ClientError;

/// Outcome of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureDecision {
    /// Leave node health unchanged.
    Ignore,
    /// Keep serving but treat the node as degraded.
    MarkSuspect,
    /// Stop new acquisitions until the dead timeout elapses.
    MarkDead,
}

/// Failure handling for one node.
pub trait NodeFailurePolicy: Send {
    /// Called for every node-level failure.
    fn on_failure(&mut self, node: &str, error: &ClientError) -> FailureDecision;

    /// Called after a successful connect or round-trip.
    fn on_success(&mut self, _node: &str) {}

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Builds the policy for a node address; `None` selects the default.
pub type FailurePolicyFactory = Arc<dyn Fn(&str) -> Option<Box<dyn NodeFailurePolicy>> + Send + Sync>;

/// Marks the node dead on any failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailImmediatelyPolicy;

impl NodeFailurePolicy for FailImmediatelyPolicy {
    fn on_failure(&mut self, _node: &str, _error: &ClientError) -> FailureDecision {
        FailureDecision::MarkDead
    }

    fn name(&self) -> &'static str {
        "fail-immediately"
    }
}

/// Tolerates up to `threshold - 1` failures inside `reset_after`.
///
/// Failures below the threshold mark the node suspect; the failure that
/// reaches it marks the node dead and restarts the count. A quiet period of
/// `reset_after` or any success also restarts the count.
pub struct ThrottlingFailurePolicy {
    threshold: u32,
    reset_after: Duration,
    failures: u32,
    window_start: Option<Instant>,
}

impl ThrottlingFailurePolicy {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        ThrottlingFailurePolicy {
            threshold: threshold.max(1),
            reset_after,
            failures: 0,
            window_start: None,
        }
    }

    /// Failures counted in the current window.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl fmt::Debug for ThrottlingFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottlingFailurePolicy")
            .field("threshold", &self.threshold)
            .field("reset_after", &self.reset_after)
            .field("failures", &self.failures)
            .finish()
    }
}

impl NodeFailurePolicy for ThrottlingFailurePolicy {
    fn on_failure(&mut self, _node: &str, _error: &ClientError) -> FailureDecision {
        let now = Instant::now();
        match self.window_start {
            Some(start) if now.duration_since(start) < self.reset_after => {}
            _ => {
                self.window_start = Some(now);
                self.failures = 0;
            }
        }

        self.failures += 1;
        if self.failures >= self.threshold {
            self.failures = 0;
            self.window_start = None;
            FailureDecision::MarkDead
        } else {
            FailureDecision::MarkSuspect
        }
    }

    fn on_success(&mut self, _node: &str) {
        self.failures = 0;
        self.window_start = None;
    }

    fn name(&self) -> &'static str {
        "throttling"
    }
}

/// Factory that always uses the default policy.
pub fn fail_immediately() -> FailurePolicyFactory {
    Arc::new(|_: &str| Some(Box::new(FailImmediatelyPolicy) as Box<dyn NodeFailurePolicy>))
}

/// Factory producing a fresh `ThrottlingFailurePolicy` per node.
pub fn throttling(threshold: u32, reset_after: Duration) -> FailurePolicyFactory {
    Arc::new(move |_: &str| {
        Some(Box::new(ThrottlingFailurePolicy::new(threshold, reset_after)) as Box<dyn NodeFailurePolicy>)
    })
}

/// Resolves the policy for `node`, falling back to `FailImmediatelyPolicy`.
pub fn policy_for(factory: Option<&FailurePolicyFactory>, node: &str) -> Box<dyn NodeFailurePolicy> {
    factory
        .and_then(|make| make(node))
        .unwrap_or_else(|| Box::new(FailImmediatelyPolicy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_error() -> ClientError {
        ClientError::io("n1", io::Error::from(io::ErrorKind::ConnectionReset))
    }

    #[test]
    fn test_default_marks_dead() {
        let mut policy = FailImmediatelyPolicy;
        assert_eq!(policy.on_failure("n1", &io_error()), FailureDecision::MarkDead);
    }

    #[test]
    fn test_throttling_suspects_then_kills() {
        let mut policy = ThrottlingFailurePolicy::new(3, Duration::from_secs(60));
        assert_eq!(policy.on_failure("n1", &io_error()), FailureDecision::MarkSuspect);
        assert_eq!(policy.on_failure("n1", &io_error()), FailureDecision::MarkSuspect);
        assert_eq!(policy.on_failure("n1", &io_error()), FailureDecision::MarkDead);
        assert_eq!(policy.failures(), 0);
    }

    #[test]
    fn test_throttling_success_resets() {
        let mut policy = ThrottlingFailurePolicy::new(2, Duration::from_secs(60));
        assert_eq!(policy.on_failure("n1", &io_error()), FailureDecision::MarkSuspect);
        policy.on_success("n1");
        assert_eq!(policy.on_failure("n1", &io_error()), FailureDecision::MarkSuspect);
    }

    #[test]
    fn test_throttling_window_expires() {
        let mut policy = ThrottlingFailurePolicy::new(2, Duration::from_millis(10));
        assert_eq!(policy.on_failure("n1", &io_error()), FailureDecision::MarkSuspect);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(policy.on_failure("n1", &io_error()), FailureDecision::MarkSuspect);
    }

    #[test]
    fn test_factory_declining_falls_back_to_default() {
        let declining: FailurePolicyFactory = Arc::new(|_: &str| None);
        assert_eq!(policy_for(Some(&declining), "n1").name(), "fail-immediately");
        assert_eq!(policy_for(None, "n1").name(), "fail-immediately");
        assert_eq!(
            policy_for(Some(&throttling(3, Duration::from_secs(1))), "n1").name(),
            "throttling"
        );
    }
}
