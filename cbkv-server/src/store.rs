//! # Document Store
//!
//! In-memory documents for the mock node: sharded locks, a CAS per document
//! and lazy expiry on access.
//!
//! ## Design Principles
//! 1. **Sharded Locks**: Keys hash to one of N `RwLock`ed maps.
//! 2. **TTL on Access**: Expired documents are removed when touched; there is
//!    no background sweeper.
//! 3. **All-or-Nothing Multi-Mutation**: Specs are applied to a copy of the
//!    document and committed only if every spec succeeds.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;

use cbkv_common::{Expiry, MutationKind, Status, DATATYPE_JSON};

use crate::path::apply_mutation;

const DEFAULT_SHARDS: usize = 16;

/// Stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub value: Bytes,
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
    pub expires_at: Option<SystemTime>,
}

impl Document {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// One spec of a sub-document mutation request.
#[derive(Debug, Clone)]
pub struct PathMutation {
    pub kind: MutationKind,
    pub flags: u8,
    pub path: String,
    pub value: Bytes,
}

/// Multi-mutation failure: first failing spec and its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateError {
    /// Document-level failure (missing, CAS mismatch, not JSON).
    Document(Status),
    /// Spec `index` failed.
    Spec { index: usize, status: Status },
}

/// Outcome of a successful sub-document mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateOutcome {
    pub cas: u64,
    /// `(spec index, value)` for specs that produce a value.
    pub values: Vec<(usize, Bytes)>,
}

type Shard = RwLock<HashMap<Bytes, Document>>;

/// Sharded document map.
#[derive(Debug)]
pub struct Store {
    shards: Vec<Shard>,
    hash_state: RandomState,
    next_cas: AtomicU64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        Store {
            shards: (0..count).map(|_| RwLock::new(HashMap::new())).collect(),
            hash_state: RandomState::new(),
            next_cas: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let idx = self.hash_state.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of live (unexpired) documents.
    pub fn len(&self) -> usize {
        let now = SystemTime::now();
        self.shards
            .iter()
            .map(|shard| shard.read().values().filter(|doc| !doc.is_expired(now)).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &[u8]) -> Result<Document, Status> {
        let now = SystemTime::now();
        {
            let map = self.shard(key).read();
            match map.get(key) {
                Some(doc) if !doc.is_expired(now) => return Ok(doc.clone()),
                Some(_) => {}
                None => return Err(Status::KeyNotFound),
            }
        }
        self.shard(key).write().retain(|_, doc| !doc.is_expired(now));
        Err(Status::KeyNotFound)
    }

    /// Stores a whole document. A non-zero `cas` must match the current one.
    pub fn set(&self, key: Bytes, value: Bytes, flags: u32, datatype: u8, expiry: Expiry, cas: u64) -> Result<u64, Status> {
        let now = SystemTime::now();
        let mut map = self.shard(&key).write();
        let existing = map.get(&key).filter(|doc| !doc.is_expired(now));
        match (existing, cas) {
            (_, 0) => {}
            (Some(doc), cas) if doc.cas == cas => {}
            (Some(_), _) => return Err(Status::KeyExists),
            (None, _) => return Err(Status::KeyNotFound),
        }
        let cas = self.next_cas();
        map.insert(
            key,
            Document {
                value,
                flags,
                datatype,
                cas,
                expires_at: expiry.deadline(now),
            },
        );
        Ok(cas)
    }

    pub fn delete(&self, key: &[u8], cas: u64) -> Result<u64, Status> {
        let now = SystemTime::now();
        let mut map = self.shard(key).write();
        match map.get(key) {
            Some(doc) if doc.is_expired(now) => {
                map.remove(key);
                Err(Status::KeyNotFound)
            }
            Some(doc) if cas != 0 && doc.cas != cas => Err(Status::KeyExists),
            Some(_) => {
                map.remove(key);
                Ok(self.next_cas())
            }
            None => Err(Status::KeyNotFound),
        }
    }

    /// Updates the expiry; returns the document with its new CAS.
    pub fn touch(&self, key: &[u8], expiry: Expiry) -> Result<Document, Status> {
        let now = SystemTime::now();
        let mut map = self.shard(key).write();
        let doc = match map.get_mut(key) {
            Some(doc) if !doc.is_expired(now) => doc,
            Some(_) => {
                map.remove(key);
                return Err(Status::KeyNotFound);
            }
            None => return Err(Status::KeyNotFound),
        };
        doc.expires_at = expiry.deadline(now);
        doc.cas = self.next_cas();
        Ok(doc.clone())
    }

    /// Applies `specs` in order; commits only if all succeed.
    pub fn mutate_in(
        &self,
        key: &[u8],
        specs: &[PathMutation],
        expiry: Option<Expiry>,
        cas: u64,
    ) -> Result<MutateOutcome, MutateError> {
        let now = SystemTime::now();
        let mut map = self.shard(key).write();
        let doc = match map.get_mut(key) {
            Some(doc) if !doc.is_expired(now) => doc,
            Some(_) => {
                map.remove(key);
                return Err(MutateError::Document(Status::KeyNotFound));
            }
            None => return Err(MutateError::Document(Status::KeyNotFound)),
        };
        if cas != 0 && doc.cas != cas {
            return Err(MutateError::Document(Status::KeyExists));
        }

        let mut root: Value =
            serde_json::from_slice(&doc.value).map_err(|_| MutateError::Document(Status::SubdocDocNotJson))?;
        let mut values = Vec::new();
        for (index, spec) in specs.iter().enumerate() {
            match apply_mutation(&mut root, spec.kind, spec.flags, &spec.path, &spec.value) {
                Ok(Some(value)) => values.push((index, value)),
                Ok(None) => {}
                Err(status) => return Err(MutateError::Spec { index, status }),
            }
        }

        let encoded = serde_json::to_vec(&root).map_err(|_| MutateError::Document(Status::InternalError))?;
        doc.value = Bytes::from(encoded);
        doc.datatype = DATATYPE_JSON;
        doc.cas = self.next_cas();
        if let Some(expiry) = expiry {
            doc.expires_at = expiry.deadline(now);
        }
        Ok(MutateOutcome { cas: doc.cas, values })
    }
}
