//! # Client API
//!
//! Purpose: Blocking facade that routes keys to nodes, builds operations
//! through an `OperationFactory` and runs them on the owning node's pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides routing, pooling and framing.
//! 2. **Factory Seam**: Every request is built by the injected factory, so a
//!    fake factory can drive the same code path in tests.
//! 3. **Typed Outcomes**: Non-success statuses become `ClientError::Server`;
//!    multi-mutation partial failures become `MutationFailed` with the index
//!    of the failing spec.

use std::sync::Arc;
use std::time::Duration;

use cbkv_common::{Cas, MutationResult, Status};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::factory::{BinaryOperationFactory, OperationFactory};
use crate::mapping::{KeyMapper, VBucketMap};
use crate::mutate_in::{MutateIn, MutateInBuilder};
use crate::node::Node;
use crate::operation::{Operation, SyncMode};
use crate::pool::ConnectionPool;
use crate::response::Response;
use crate::sequence::SequenceGenerator;
use crate::transcoder::Transcoder;
use crate::transport::{TcpTransport, Transport};

/// Result of a sub-document mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Document CAS after the mutation.
    pub cas: Cas,
    /// Per-spec results that carry a value (counters), in spec order.
    pub results: Vec<MutationResult>,
}

/// Blocking client for a set of nodes.
pub struct Client {
    nodes: Vec<Node>,
    mapper: Arc<dyn KeyMapper>,
    factory: Arc<dyn OperationFactory>,
}

impl Client {
    /// Builds a TCP client from declarative configuration.
    pub fn connect(config: &ClientConfig) -> ClientResult<Self> {
        Self::with_transport(config, Arc::new(TcpTransport))
    }

    /// Builds a client using `transport` for every node.
    ///
    /// # Errors
    /// `Config` when the configuration does not resolve, `Routing` when the
    /// vBucket map cannot be built.
    pub fn with_transport(config: &ClientConfig, transport: Arc<dyn Transport>) -> ClientResult<Self> {
        let pool_config = config.resolve_pool()?;
        let mapper: Arc<dyn KeyMapper> = Arc::new(VBucketMap::uniform(config.servers.clone(), config.vbucket_count)?);

        let mut nodes = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let pool = ConnectionPool::new(server.clone(), pool_config.clone(), transport.clone())?;
            nodes.push(Node::new(pool));
        }

        let factory = BinaryOperationFactory::with_sequence(mapper.clone(), SequenceGenerator::shared())
            .with_timeout(config.operation_timeout());
        Ok(Client {
            nodes,
            mapper,
            factory: Arc::new(factory),
        })
    }

    /// Assembles a client from already-built parts.
    ///
    /// `nodes[i]` must serve `mapper.servers()[i]`.
    pub fn from_parts(nodes: Vec<Node>, mapper: Arc<dyn KeyMapper>, factory: Arc<dyn OperationFactory>) -> Self {
        Client {
            nodes,
            mapper,
            factory,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn mapper(&self) -> &dyn KeyMapper {
        self.mapper.as_ref()
    }

    pub fn factory(&self) -> &dyn OperationFactory {
        self.factory.as_ref()
    }

    /// Warms every node's pool; returns the first failure.
    pub fn warm_up(&self) -> ClientResult<usize> {
        let mut opened = 0;
        for node in &self.nodes {
            opened += node.pool().warm_up()?;
        }
        Ok(opened)
    }

    /// Sends `op` to its node and maps the reply status.
    pub fn execute(&self, op: &Operation) -> ClientResult<Response> {
        let node = self
            .nodes
            .get(op.route().node)
            .ok_or_else(|| ClientError::Routing(format!("no node at index {}", op.route().node)))?;
        node.pool().execute(op)?.into_result(op.opcode())
    }

    /// Reads a document.
    pub fn get<T>(&self, key: &str, transcoder: &impl Transcoder<T>) -> ClientResult<(T, Cas)> {
        let response = self.execute(&self.factory.get(key)?)?;
        Ok((response.content(transcoder)?, response.cas()))
    }

    /// Writes a document; `expiry` of zero means never expire.
    pub fn upsert<T>(&self, key: &str, value: &T, transcoder: &impl Transcoder<T>, expiry: Duration) -> ClientResult<Cas> {
        let document = transcoder.encode(value)?;
        let op = self.factory.upsert(key, document, expiry, Cas::NONE)?;
        Ok(self.execute(&op)?.cas())
    }

    /// Removes a document.
    pub fn remove(&self, key: &str) -> ClientResult<()> {
        self.execute(&self.factory.remove(key, Cas::NONE)?)?;
        Ok(())
    }

    /// Sets a new expiry.
    pub fn touch(&self, key: &str, expiry: Duration) -> ClientResult<Cas> {
        Ok(self.execute(&self.factory.touch(key, expiry)?)?.cas())
    }

    /// Reads a document and sets a new expiry.
    pub fn get_and_touch<T>(&self, key: &str, expiry: Duration, transcoder: &impl Transcoder<T>) -> ClientResult<(T, Cas)> {
        let response = self.execute(&self.factory.get_and_touch(key, expiry)?)?;
        Ok((response.content(transcoder)?, response.cas()))
    }

    /// Waits for the given mutations to reach `mode`.
    pub fn sync(&self, mode: SyncMode, keys: &[(&str, Cas)], replicas: u8) -> ClientResult<()> {
        self.execute(&self.factory.sync(mode, keys, replicas)?)?;
        Ok(())
    }

    /// Round-trips a no-op to node `node`.
    pub fn noop(&self, node: usize) -> ClientResult<()> {
        self.execute(&self.factory.noop(node)?)?;
        Ok(())
    }

    /// Seals `builder` and applies its mutations.
    pub fn mutate_in(&self, builder: MutateInBuilder) -> ClientResult<MutationOutcome> {
        self.mutate_in_sealed(&builder.seal()?)
    }

    /// Applies an already-sealed set of mutations.
    pub fn mutate_in_sealed(&self, mutations: &MutateIn) -> ClientResult<MutationOutcome> {
        let op = self.factory.mutate_in(mutations)?;
        let response = self.execute(&op)?;
        let results = if mutations.is_single() {
            if response.value().is_empty() {
                Vec::new()
            } else {
                vec![MutationResult {
                    index: 0,
                    status: Status::Success,
                    value: response.value().clone(),
                }]
            }
        } else {
            response.mutation_results()?
        };
        Ok(MutationOutcome {
            cas: response.cas(),
            results,
        })
    }

    /// Closes every pool.
    pub fn close(&self) {
        for node in &self.nodes {
            node.pool().close();
        }
    }
}
