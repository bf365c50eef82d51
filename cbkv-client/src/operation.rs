//! # Operations
//!
//! Purpose: Typed wire requests. Every operation carries its opcode, key,
//! route (node + vBucket), correlation id, timeout and body, and knows how to
//! serialize itself into one binary-protocol frame.
//!
//! ## Design Principles
//! 1. **Closed Variant Set**: One `Operation` struct with an `OperationBody`
//!    enum; serialization is a single match keyed on the body, not a type
//!    per opcode.
//! 2. **Id at Construction**: The correlation id is drawn from the
//!    `SequenceGenerator` when the operation is built, so an operation that
//!    is never sent still consumes an id.
//! 3. **Owned Payloads**: Sub-document operations clone the sealed specs
//!    (cheap `Bytes`/`Arc` clones); nothing is shared with an open builder.
//! 4. **Immutable After Build**: No setters; retries build a new operation.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use cbkv_common::{
    encode_mutation_block, Cas, Expiry, MutationKind, Opcode, ProtocolError, ProtocolResult,
    RequestFrame, SinglePathExtras, DATATYPE_RAW, MAX_BODY_LEN, MAX_KEY_LEN, MAX_MUTATION_SPECS,
    MUTATION_BLOCK_HEADER_LEN,
};

use crate::error::{ClientError, ClientResult};
use crate::mapping::Route;
use crate::mutate_in::{MutateIn, MutationSpec};
use crate::sequence::SequenceGenerator;
use crate::transcoder::Encoded;

/// Sync flag: wait until the mutation is visible.
pub const SYNC_FLAG_MUTATION: u32 = 0x04;

/// Sync flag: wait until the mutation is persisted.
pub const SYNC_FLAG_PERSISTENCE: u32 = 0x08;

/// Bit offset of the replica count in the sync flags.
pub const SYNC_REPLICA_SHIFT: u32 = 4;

/// Largest replica count a sync request can wait for.
pub const MAX_SYNC_REPLICAS: u8 = 0x0f;

/// What a sync request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Mutation applied in memory on the active node.
    Mutation,
    /// Mutation written to disk on the active node.
    Persistence,
    /// Mutation copied to the requested number of replicas.
    Replication,
}

/// One key observed by a sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncKey {
    pub key: Bytes,
    pub cas: Cas,
    pub vbucket: u16,
}

/// Body of an operation, keyed by what the encoder must emit.
#[derive(Debug, Clone)]
pub enum OperationBody {
    /// Header and key only (get, delete, noop).
    Plain,
    /// Full document write: flags + expiry extras, document value.
    Store {
        value: Bytes,
        flags: u32,
        datatype: u8,
        expiry: Expiry,
    },
    /// Expiry-only extras (touch, get-and-touch).
    Expiry(Expiry),
    /// Sync request over a list of keys.
    Sync {
        mode: SyncMode,
        replicas: u8,
        keys: Vec<SyncKey>,
    },
    /// Single-path sub-document mutation.
    SubdocPath {
        spec: MutationSpec,
        expiry: Option<Expiry>,
    },
    /// Multi-mutation; blocks encoded in spec order.
    SubdocMulti {
        specs: Arc<[MutationSpec]>,
        expiry: Option<Expiry>,
    },
}

impl OperationBody {
    /// Extras plus value bytes this body adds to the frame.
    fn encoded_len(&self) -> usize {
        match self {
            OperationBody::Plain => 0,
            OperationBody::Store { value, .. } => 8 + value.len(),
            OperationBody::Expiry(_) => 4,
            OperationBody::Sync { keys, .. } => 6 + keys.iter().map(|k| 12 + k.key.len()).sum::<usize>(),
            OperationBody::SubdocPath { spec, expiry } => {
                let extras = if expiry.is_some() { 7 } else { 3 };
                extras + spec.path().len() + spec.value().len()
            }
            OperationBody::SubdocMulti { specs, expiry } => {
                let extras = if expiry.is_some() { 4 } else { 0 };
                extras
                    + specs
                        .iter()
                        .map(|spec| MUTATION_BLOCK_HEADER_LEN + spec.path().len() + spec.value().len())
                        .sum::<usize>()
            }
        }
    }
}

/// A fully built request.
#[derive(Debug, Clone)]
pub struct Operation {
    opcode: Opcode,
    key: Bytes,
    route: Route,
    opaque: u32,
    cas: Cas,
    timeout: Duration,
    body: OperationBody,
}

impl Operation {
    fn build(
        sequence: &SequenceGenerator,
        opcode: Opcode,
        key: Bytes,
        route: Route,
        timeout: Duration,
        cas: Cas,
        body: OperationBody,
    ) -> ClientResult<Self> {
        if key.len() > MAX_KEY_LEN {
            return Err(ClientError::InvalidArgument(format!(
                "key of {} bytes exceeds {MAX_KEY_LEN}",
                key.len()
            )));
        }
        let body_len = key.len() + body.encoded_len();
        if body_len > MAX_BODY_LEN as usize {
            return Err(ClientError::InvalidArgument(format!(
                "request body of {body_len} bytes exceeds {MAX_BODY_LEN}"
            )));
        }
        Ok(Operation {
            opcode,
            key,
            route,
            opaque: sequence.next(),
            cas,
            timeout,
            body,
        })
    }

    /// Fetches a whole document.
    pub fn get(sequence: &SequenceGenerator, key: Bytes, route: Route, timeout: Duration) -> ClientResult<Self> {
        Self::build(sequence, Opcode::Get, key, route, timeout, Cas::NONE, OperationBody::Plain)
    }

    /// Writes a whole document.
    pub fn upsert(
        sequence: &SequenceGenerator,
        key: Bytes,
        route: Route,
        timeout: Duration,
        document: Encoded,
        expiry: Expiry,
        cas: Cas,
    ) -> ClientResult<Self> {
        let body = OperationBody::Store {
            value: document.bytes,
            flags: document.flags,
            datatype: document.datatype,
            expiry,
        };
        Self::build(sequence, Opcode::Set, key, route, timeout, cas, body)
    }

    /// Removes a whole document.
    pub fn remove(
        sequence: &SequenceGenerator,
        key: Bytes,
        route: Route,
        timeout: Duration,
        cas: Cas,
    ) -> ClientResult<Self> {
        Self::build(sequence, Opcode::Delete, key, route, timeout, cas, OperationBody::Plain)
    }

    /// Round-trip with no side effects; used for health probing.
    pub fn noop(sequence: &SequenceGenerator, route: Route, timeout: Duration) -> ClientResult<Self> {
        Self::build(sequence, Opcode::Noop, Bytes::new(), route, timeout, Cas::NONE, OperationBody::Plain)
    }

    /// Updates a document's expiry.
    pub fn touch(
        sequence: &SequenceGenerator,
        key: Bytes,
        route: Route,
        timeout: Duration,
        expiry: Expiry,
    ) -> ClientResult<Self> {
        Self::build(sequence, Opcode::Touch, key, route, timeout, Cas::NONE, OperationBody::Expiry(expiry))
    }

    /// Fetches a document and updates its expiry in one round-trip.
    pub fn get_and_touch(
        sequence: &SequenceGenerator,
        key: Bytes,
        route: Route,
        timeout: Duration,
        expiry: Expiry,
    ) -> ClientResult<Self> {
        Self::build(
            sequence,
            Opcode::GetAndTouch,
            key,
            route,
            timeout,
            Cas::NONE,
            OperationBody::Expiry(expiry),
        )
    }

    /// Waits for mutations on `keys` to reach the requested durability.
    pub fn sync(
        sequence: &SequenceGenerator,
        route: Route,
        timeout: Duration,
        mode: SyncMode,
        replicas: u8,
        keys: Vec<SyncKey>,
    ) -> ClientResult<Self> {
        if keys.is_empty() {
            return Err(ClientError::InvalidArgument("sync needs at least one key".into()));
        }
        if keys.len() > u16::MAX as usize {
            return Err(ClientError::InvalidArgument(format!("{} sync keys is too many", keys.len())));
        }
        if replicas > MAX_SYNC_REPLICAS {
            return Err(ClientError::InvalidArgument(format!(
                "replication count {replicas} exceeds {MAX_SYNC_REPLICAS}"
            )));
        }
        if mode == SyncMode::Replication && replicas == 0 {
            return Err(ClientError::InvalidArgument(
                "replication sync needs a replication count".into(),
            ));
        }
        if let Some(bad) = keys.iter().find(|k| k.key.is_empty() || k.key.len() > MAX_KEY_LEN) {
            return Err(ClientError::InvalidArgument(format!(
                "invalid sync key of {} bytes",
                bad.key.len()
            )));
        }
        let body = OperationBody::Sync { mode, replicas, keys };
        Self::build(sequence, Opcode::Sync, Bytes::new(), route, timeout, Cas::NONE, body)
    }

    /// Builds the sub-document operation for a sealed builder.
    ///
    /// A single spec collapses into the single-path command for its kind; two
    /// or more become one multi-mutation whose blocks follow builder order.
    pub fn mutate_in(
        sequence: &SequenceGenerator,
        mutations: &MutateIn,
        route: Route,
        timeout: Duration,
        expiry: Option<Expiry>,
    ) -> ClientResult<Self> {
        let key = Bytes::copy_from_slice(mutations.key().as_bytes());
        if mutations.is_single() {
            let spec = mutations.first_spec().clone();
            let opcode = spec.kind().opcode();
            let body = OperationBody::SubdocPath { spec, expiry };
            return Self::build(sequence, opcode, key, route, timeout, mutations.cas(), body);
        }

        if mutations.specs().len() > MAX_MUTATION_SPECS {
            return Err(ClientError::InvalidSpec(format!(
                "at most {MAX_MUTATION_SPECS} specs per document"
            )));
        }
        let body = OperationBody::SubdocMulti {
            specs: Arc::from(mutations.specs()),
            expiry,
        };
        Self::build(
            sequence,
            Opcode::SubdocMultiMutation,
            key,
            route,
            timeout,
            mutations.cas(),
            body,
        )
    }

    /// Command code.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Document key (empty for noop/sync).
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Target node and shard.
    pub fn route(&self) -> Route {
        self.route
    }

    /// Correlation id (opaque).
    pub fn correlation_id(&self) -> u32 {
        self.opaque
    }

    /// Maximum time to wait for the response.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// CAS sent with the request.
    pub fn cas(&self) -> Cas {
        self.cas
    }

    /// Request body.
    pub fn body(&self) -> &OperationBody {
        &self.body
    }

    /// Path of a single-path sub-document operation.
    pub fn path(&self) -> Option<&str> {
        match &self.body {
            OperationBody::SubdocPath { spec, .. } => Some(spec.path()),
            _ => None,
        }
    }

    /// Specs carried by a sub-document operation, in wire order.
    pub fn specs(&self) -> &[MutationSpec] {
        match &self.body {
            OperationBody::SubdocPath { spec, .. } => std::slice::from_ref(spec),
            OperationBody::SubdocMulti { specs, .. } => specs,
            _ => &[],
        }
    }

    /// Appends this operation's frame to `out`.
    pub fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        let mut extras = [0u8; 8];
        let mut scratch = BytesMut::new();
        let mut datatype = DATATYPE_RAW;

        let (extras_len, value): (usize, &[u8]) = match &self.body {
            OperationBody::Plain => (0, &[]),
            OperationBody::Store {
                value,
                flags,
                datatype: doc_type,
                expiry,
            } => {
                extras[..4].copy_from_slice(&flags.to_be_bytes());
                extras[4..].copy_from_slice(&expiry.as_raw().to_be_bytes());
                datatype = *doc_type;
                (8, &value[..])
            }
            OperationBody::Expiry(expiry) => {
                extras[..4].copy_from_slice(&expiry.as_raw().to_be_bytes());
                (4, &[])
            }
            OperationBody::Sync { mode, replicas, keys } => {
                encode_sync_payload(&mut scratch, *mode, *replicas, keys);
                (0, &scratch[..])
            }
            OperationBody::SubdocPath { spec, expiry } => {
                let path = spec.path().as_bytes();
                if path.len() > u16::MAX as usize {
                    return Err(ProtocolError::PathTooLong(path.len()));
                }
                let (buf, len) = SinglePathExtras {
                    path_len: path.len() as u16,
                    flags: spec.flags(),
                    expiry: expiry.map(Expiry::as_raw),
                }
                .encode();
                extras[..len].copy_from_slice(&buf[..len]);
                scratch.reserve(path.len() + spec.value().len());
                scratch.put_slice(path);
                scratch.put_slice(spec.value());
                (len, &scratch[..])
            }
            OperationBody::SubdocMulti { specs, expiry } => {
                for spec in specs.iter() {
                    encode_mutation_block(
                        &mut scratch,
                        spec.kind().opcode(),
                        spec.flags(),
                        spec.path().as_bytes(),
                        spec.value(),
                    )?;
                }
                match expiry {
                    Some(expiry) => {
                        extras[..4].copy_from_slice(&expiry.as_raw().to_be_bytes());
                        (4, &scratch[..])
                    }
                    None => (0, &scratch[..]),
                }
            }
        };

        RequestFrame {
            opcode: self.opcode,
            datatype,
            vbucket: self.route.vbucket.get(),
            opaque: self.opaque,
            cas: self.cas.0,
            extras: &extras[..extras_len],
            key: &self.key,
            value,
        }
        .encode(out)
    }

    /// Encodes into a fresh buffer.
    pub fn to_bytes(&self) -> ProtocolResult<Bytes> {
        let mut out = BytesMut::new();
        self.encode(&mut out)?;
        Ok(out.freeze())
    }

    /// Kind of the single-path mutation, when this is one.
    pub fn mutation_kind(&self) -> Option<MutationKind> {
        MutationKind::from_opcode(self.opcode)
    }
}

/// Sync value: flags(4) nkeys(2) then per key cas(8) vbucket(2) keylen(2) key.
fn encode_sync_payload(out: &mut BytesMut, mode: SyncMode, replicas: u8, keys: &[SyncKey]) {
    let flags = match mode {
        SyncMode::Mutation => SYNC_FLAG_MUTATION,
        SyncMode::Persistence => SYNC_FLAG_PERSISTENCE,
        SyncMode::Replication => 0,
    } | ((replicas as u32 & MAX_SYNC_REPLICAS as u32) << SYNC_REPLICA_SHIFT);

    out.put_u32(flags);
    out.put_u16(keys.len() as u16);
    for key in keys {
        out.put_u64(key.cas.0);
        out.put_u16(key.vbucket);
        out.put_u16(key.key.len() as u16);
        out.put_slice(&key.key);
    }
}
