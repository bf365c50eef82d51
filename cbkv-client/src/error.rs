//! # Client Errors
//!
//! Every failure a caller can observe. Resource-pressure variants carry the
//! node address and the elapsed time so callers can decide whether to retry;
//! the pool itself never retries.

use std::io;
use std::time::Duration;

use thiserror::Error;

use cbkv_common::{Opcode, ProtocolError, Status};

use crate::config::ConfigError;
use crate::transcoder::TranscodeError;

/// Result type for the client runtime.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed caller input (empty key, bad expiry, empty key list).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutation spec rejected by the builder (empty path, too many specs).
    #[error("invalid mutation spec: {0}")]
    InvalidSpec(String),

    /// `first_spec` on a builder with no specs.
    #[error("mutation builder holds no specs")]
    EmptyBuilder,

    /// Establishing a connection took longer than `connection_timeout`.
    #[error("connecting to {node} timed out after {elapsed:?}")]
    ConnectTimeout { node: String, elapsed: Duration },

    /// No connection became available within `queue_timeout`.
    #[error("connection pool for {node} exhausted after waiting {waited:?}")]
    PoolExhausted { node: String, waited: Duration },

    /// No matching response arrived within the receive timeout.
    #[error("no response from {node} within {elapsed:?}")]
    ReceiveTimeout { node: String, elapsed: Duration },

    /// Node is gated by its failure policy.
    #[error("node {node} is marked dead; next probe allowed in {retry_in:?}")]
    NodeDead { node: String, retry_in: Duration },

    /// Transport failure while connecting, writing or reading.
    #[error("io error on {node}: {source}")]
    Io {
        node: String,
        #[source]
        source: io::Error,
    },

    /// Frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Server answered with a non-success status.
    #[error("server returned {status} for {opcode:?}")]
    Server { opcode: Opcode, status: Status },

    /// Multi-mutation rejected at a specific spec.
    #[error("mutation spec #{index} failed with {status}")]
    MutationFailed { index: usize, status: Status },

    /// Value could not be converted to or from bytes.
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    /// Key could not be mapped to a node.
    #[error("routing error: {0}")]
    Routing(String),

    /// Configuration failed to resolve.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Pool was shut down.
    #[error("connection pool for {node} is closed")]
    PoolClosed { node: String },
}

impl ClientError {
    /// Returns true for errors the failure policy should hear about.
    ///
    /// Receive timeouts and pool pressure are not node failures: the
    /// connection may still be fine and the node may merely be busy.
    /// `Protocol` only comes from decoding what a node sent; requests that
    /// cannot be encoded fail as `InvalidArgument`.
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectTimeout { .. } | ClientError::Io { .. } | ClientError::Protocol(_)
        )
    }

    /// Wraps an I/O error with the node address.
    pub(crate) fn io(node: &str, source: io::Error) -> Self {
        ClientError::Io {
            node: node.to_string(),
            source,
        }
    }
}
