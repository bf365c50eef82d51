//! # CBKV Client Runtime
//!
//! Purpose: Turn application intent into correlated binary-protocol
//! operations and run them over bounded, health-gated per-node connection
//! pools.
//!
//! ## Design Principles
//! 1. **Closed Operation Model**: One `Operation` type with an opcode-keyed
//!    encoder; sub-document builders are sealed before an operation can own
//!    them.
//! 2. **Object Pool Pattern**: Each node owns a bounded pool; callers lease
//!    connections and the lease returns them on drop.
//! 3. **Pluggable Failure Handling**: Node failures go through a
//!    `NodeFailurePolicy`; the pool only enforces its decisions.
//! 4. **Trait Seams for Tests**: Transport, key mapping, transcoding and
//!    operation construction are traits with real and fake implementations.

mod client;
mod config;
mod error;
mod factory;
mod failure;
mod mapping;
mod mutate_in;
mod node;
mod operation;
mod pool;
mod response;
mod sequence;
mod stats;
mod transcoder;
mod transport;

pub use client::{Client, MutationOutcome};
pub use config::{ClientConfig, ConfigError, ConnectionPoolConfig, FailurePolicySettings, PoolSettings};
pub use error::{ClientError, ClientResult};
pub use factory::{BinaryOperationFactory, OperationFactory, DEFAULT_OPERATION_TIMEOUT};
pub use failure::{
    fail_immediately, policy_for, throttling, FailImmediatelyPolicy, FailureDecision, FailurePolicyFactory,
    NodeFailurePolicy, ThrottlingFailurePolicy,
};
pub use mapping::{KeyMapper, Route, VBucketMap, DEFAULT_VBUCKET_COUNT};
pub use mutate_in::{MutateIn, MutateInBuilder, MutationSpec};
pub use node::{Node, NodeHealth};
pub use operation::{Operation, OperationBody, SyncKey, SyncMode};
pub use pool::{ConnectionPool, PooledConnection};
pub use response::Response;
pub use sequence::SequenceGenerator;
pub use stats::{PoolStatsSnapshot, WaitSnapshot};
pub use transcoder::{Encoded, JsonTranscoder, RawTranscoder, TranscodeError, Transcoder, FLAGS_BINARY, FLAGS_JSON};
pub use transport::{Socket, SocketTuning, TcpTransport, Transport};

pub use cbkv_common::{Cas, Expiry, MutationKind, MutationResult, Opcode, Status, VBucketId};
