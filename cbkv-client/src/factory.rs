//! # Operation Factory
//!
//! Purpose: Build operations from caller intent without exposing wire
//! details. Callers and the client facade depend on the `OperationFactory`
//! trait; tests can substitute their own implementation.
//!
//! ## Design Principles
//! 1. **Validate Before Building**: Empty keys, out-of-range expiries and
//!    empty sync key lists fail with `InvalidArgument` before any correlation
//!    id is consumed.
//! 2. **Routing Inside**: The factory resolves the route through the injected
//!    `KeyMapper`, so an operation always knows its node and vBucket.
//! 3. **Injected Sequence**: Correlation ids come from the generator handed
//!    to the factory; isolated tests use their own.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use cbkv_common::{Cas, Expiry, VBucketId};

use crate::error::{ClientError, ClientResult};
use crate::mapping::{KeyMapper, Route};
use crate::mutate_in::MutateIn;
use crate::operation::{Operation, SyncKey, SyncMode};
use crate::sequence::SequenceGenerator;
use crate::transcoder::Encoded;

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(2500);

/// One constructor per supported intent.
pub trait OperationFactory: Send + Sync {
    /// Whole-document read.
    fn get(&self, key: &str) -> ClientResult<Operation>;

    /// Whole-document write; `expiry` of zero means never expire.
    fn upsert(&self, key: &str, document: Encoded, expiry: Duration, cas: Cas) -> ClientResult<Operation>;

    /// Whole-document removal.
    fn remove(&self, key: &str, cas: Cas) -> ClientResult<Operation>;

    /// No-op addressed to a node rather than a key.
    fn noop(&self, node: usize) -> ClientResult<Operation>;

    /// Sets a new expiry on `key`.
    fn touch(&self, key: &str, expiry: Duration) -> ClientResult<Operation>;

    /// Reads `key` and sets a new expiry.
    fn get_and_touch(&self, key: &str, expiry: Duration) -> ClientResult<Operation>;

    /// Waits for durability of the given (key, CAS) pairs.
    fn sync(&self, mode: SyncMode, keys: &[(&str, Cas)], replicas: u8) -> ClientResult<Operation>;

    /// Sub-document mutation from a sealed builder.
    fn mutate_in(&self, mutations: &MutateIn) -> ClientResult<Operation>;
}

/// Factory producing binary-protocol operations.
pub struct BinaryOperationFactory {
    mapper: Arc<dyn KeyMapper>,
    sequence: Arc<SequenceGenerator>,
    timeout: Duration,
}

impl BinaryOperationFactory {
    /// Creates a factory using the process-wide sequence generator.
    pub fn new(mapper: Arc<dyn KeyMapper>) -> Self {
        Self::with_sequence(mapper, SequenceGenerator::shared())
    }

    /// Creates a factory drawing ids from `sequence`.
    pub fn with_sequence(mapper: Arc<dyn KeyMapper>, sequence: Arc<SequenceGenerator>) -> Self {
        BinaryOperationFactory {
            mapper,
            sequence,
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Overrides the timeout stamped on every operation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn route(&self, key: &str) -> ClientResult<(Bytes, Route)> {
        if key.is_empty() {
            return Err(ClientError::InvalidArgument("key must not be empty".into()));
        }
        let route = self.mapper.route(key.as_bytes())?;
        Ok((Bytes::copy_from_slice(key.as_bytes()), route))
    }
}

fn to_expiry(ttl: Duration) -> ClientResult<Expiry> {
    Expiry::from_ttl(ttl, SystemTime::now())
        .map_err(|err| ClientError::InvalidArgument(err.to_string()))
}

impl OperationFactory for BinaryOperationFactory {
    fn get(&self, key: &str) -> ClientResult<Operation> {
        let (key, route) = self.route(key)?;
        Operation::get(&self.sequence, key, route, self.timeout)
    }

    fn upsert(&self, key: &str, document: Encoded, ttl: Duration, cas: Cas) -> ClientResult<Operation> {
        let expiry = to_expiry(ttl)?;
        let (key, route) = self.route(key)?;
        Operation::upsert(&self.sequence, key, route, self.timeout, document, expiry, cas)
    }

    fn remove(&self, key: &str, cas: Cas) -> ClientResult<Operation> {
        let (key, route) = self.route(key)?;
        Operation::remove(&self.sequence, key, route, self.timeout, cas)
    }

    fn noop(&self, node: usize) -> ClientResult<Operation> {
        if node >= self.mapper.servers().len() {
            return Err(ClientError::Routing(format!("no server at index {node}")));
        }
        let route = Route {
            node,
            vbucket: VBucketId(0),
        };
        Operation::noop(&self.sequence, route, self.timeout)
    }

    fn touch(&self, key: &str, ttl: Duration) -> ClientResult<Operation> {
        let expiry = to_expiry(ttl)?;
        let (key, route) = self.route(key)?;
        Operation::touch(&self.sequence, key, route, self.timeout, expiry)
    }

    fn get_and_touch(&self, key: &str, ttl: Duration) -> ClientResult<Operation> {
        let expiry = to_expiry(ttl)?;
        let (key, route) = self.route(key)?;
        Operation::get_and_touch(&self.sequence, key, route, self.timeout, expiry)
    }

    fn sync(&self, mode: SyncMode, keys: &[(&str, Cas)], replicas: u8) -> ClientResult<Operation> {
        let Some(((first, _), _)) = keys.split_first() else {
            return Err(ClientError::InvalidArgument("sync needs at least one key".into()));
        };
        let (_, route) = self.route(first)?;

        let mut sync_keys = Vec::with_capacity(keys.len());
        for (key, cas) in keys {
            let (bytes, key_route) = self.route(key)?;
            if key_route.node != route.node {
                return Err(ClientError::InvalidArgument(format!(
                    "sync keys span nodes {} and {}",
                    route.node, key_route.node
                )));
            }
            sync_keys.push(SyncKey {
                key: bytes,
                cas: *cas,
                vbucket: key_route.vbucket.get(),
            });
        }
        Operation::sync(&self.sequence, route, self.timeout, mode, replicas, sync_keys)
    }

    fn mutate_in(&self, mutations: &MutateIn) -> ClientResult<Operation> {
        let expiry = mutations.expiry().map(to_expiry).transpose()?;
        let (_, route) = self.route(mutations.key())?;
        Operation::mutate_in(&self.sequence, mutations, route, self.timeout, expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbkv_common::Opcode;

    use crate::mapping::VBucketMap;
    use crate::mutate_in::MutateInBuilder;

    fn factory() -> BinaryOperationFactory {
        let map = VBucketMap::uniform(vec!["127.0.0.1:11210".into()], 64).unwrap();
        BinaryOperationFactory::with_sequence(Arc::new(map), Arc::new(SequenceGenerator::new()))
    }

    #[test]
    fn test_touch_validates_key() {
        let factory = factory();
        let err = factory.touch("", Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let first = factory.touch("k", Duration::from_secs(60)).unwrap();
        let second = factory.touch("k", Duration::from_secs(60)).unwrap();
        assert_eq!(first.opcode(), Opcode::Touch);
        assert_ne!(first.correlation_id(), second.correlation_id());
    }

    #[test]
    fn test_rejects_sub_second_expiry() {
        let err = factory().get_and_touch("k", Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn test_sync_requires_keys() {
        let err = factory().sync(SyncMode::Persistence, &[], 0).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let op = factory()
            .sync(SyncMode::Persistence, &[("a", Cas(1)), ("b", Cas(2))], 0)
            .unwrap();
        assert_eq!(op.opcode(), Opcode::Sync);
    }

    #[test]
    fn test_sync_rejects_keys_on_different_nodes() {
        let servers = vec!["a:1".to_string(), "b:1".to_string()];
        let map = VBucketMap::uniform(servers, 1024).unwrap();
        let factory = BinaryOperationFactory::with_sequence(Arc::new(map.clone()), Arc::new(SequenceGenerator::new()));

        let keys: Vec<String> = (0..64).map(|i| format!("key{i}")).collect();
        let first = map.route(keys[0].as_bytes()).unwrap().node;
        let other = keys
            .iter()
            .find(|k| map.route(k.as_bytes()).unwrap().node != first)
            .unwrap();
        let err = factory
            .sync(SyncMode::Mutation, &[(keys[0].as_str(), Cas::NONE), (other.as_str(), Cas::NONE)], 0)
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn test_mutate_in_routes_and_keeps_path() {
        let factory = factory();
        let sealed = MutateInBuilder::new("doc").delete("x").unwrap().seal().unwrap();
        let op = factory.mutate_in(&sealed).unwrap();
        assert_eq!(op.opcode(), Opcode::SubdocDelete);
        assert_eq!(op.path(), Some("x"));
        assert_eq!(op.timeout(), DEFAULT_OPERATION_TIMEOUT);
    }

    #[test]
    fn test_noop_checks_node_index() {
        assert!(factory().noop(0).is_ok());
        assert!(matches!(factory().noop(3), Err(ClientError::Routing(_))));
    }
}
