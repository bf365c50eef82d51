//! # Sub-Document Mutation Builder
//!
//! Purpose: Accumulate path-scoped mutations for one document, then freeze
//! them into an ordered snapshot that an operation can own.
//!
//! ## Design Principles
//! 1. **Two-Phase Type**: `MutateInBuilder` is open for appends;
//!    `MutateIn::seal` consumes it and yields `MutateIn`, which has no
//!    append API. An operation built from a sealed value can never observe a
//!    later append.
//! 2. **Wire Order = Insertion Order**: Specs keep their insertion index; the
//!    server applies them, and reports failures, in that order.
//! 3. **Local Validation Only**: The builder checks path presence, value
//!    presence and the spec cap; semantic conflicts are left to the server.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use cbkv_common::{Cas, MutationKind, MAX_MUTATION_SPECS, MAX_PATH_LEN, PATH_FLAG_CREATE_PARENTS};

use crate::error::{ClientError, ClientResult};
use crate::transcoder::TranscodeError;

/// One path-scoped mutation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationSpec {
    path: String,
    kind: MutationKind,
    value: Bytes,
    flags: u8,
    order: usize,
}

impl MutationSpec {
    /// Path inside the document.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mutation kind.
    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    /// Encoded JSON fragment (empty for deletes).
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Path flags sent with the spec.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Position in the builder (0-based).
    pub fn order(&self) -> usize {
        self.order
    }
}

/// Open builder for a multi-path mutation of one document.
#[derive(Debug, Clone)]
pub struct MutateInBuilder {
    key: String,
    specs: Vec<MutationSpec>,
    expiry: Option<Duration>,
    cas: Cas,
}

impl MutateInBuilder {
    /// Starts a builder for the document `key`.
    pub fn new(key: impl Into<String>) -> Self {
        MutateInBuilder {
            key: key.into(),
            specs: Vec::new(),
            expiry: None,
            cas: Cas::NONE,
        }
    }

    /// Appends a spec with an already-encoded fragment.
    ///
    /// # Errors
    /// `InvalidSpec` when the path is empty or too long, when the fragment is
    /// missing (or present on a delete), or when the builder already holds
    /// `MAX_MUTATION_SPECS` specs.
    pub fn add(self, path: impl Into<String>, kind: MutationKind, value: impl Into<Bytes>) -> ClientResult<Self> {
        self.push(path.into(), kind, value.into(), 0)
    }

    /// Like [`add`](Self::add) but creates missing parents on the server.
    pub fn add_creating_parents(
        self,
        path: impl Into<String>,
        kind: MutationKind,
        value: impl Into<Bytes>,
    ) -> ClientResult<Self> {
        self.push(path.into(), kind, value.into(), PATH_FLAG_CREATE_PARENTS)
    }

    /// Appends a spec whose fragment is `value` serialized as JSON.
    pub fn add_json<T: Serialize + ?Sized>(
        self,
        path: impl Into<String>,
        kind: MutationKind,
        value: &T,
    ) -> ClientResult<Self> {
        let fragment = serde_json::to_vec(value).map_err(TranscodeError::from)?;
        self.push(path.into(), kind, Bytes::from(fragment), 0)
    }

    /// Adds a dictionary entry that must not exist yet.
    pub fn insert<T: Serialize + ?Sized>(self, path: impl Into<String>, value: &T) -> ClientResult<Self> {
        self.add_json(path, MutationKind::Insert, value)
    }

    /// Adds or replaces a dictionary entry.
    pub fn upsert<T: Serialize + ?Sized>(self, path: impl Into<String>, value: &T) -> ClientResult<Self> {
        self.add_json(path, MutationKind::Upsert, value)
    }

    /// Replaces an existing value.
    pub fn replace<T: Serialize + ?Sized>(self, path: impl Into<String>, value: &T) -> ClientResult<Self> {
        self.add_json(path, MutationKind::Replace, value)
    }

    /// Removes the value at `path`.
    pub fn delete(self, path: impl Into<String>) -> ClientResult<Self> {
        self.push(path.into(), MutationKind::Delete, Bytes::new(), 0)
    }

    /// Appends to the array at `path`.
    pub fn array_append<T: Serialize + ?Sized>(self, path: impl Into<String>, value: &T) -> ClientResult<Self> {
        self.add_json(path, MutationKind::ArrayAppend, value)
    }

    /// Adds `delta` to the number at `path`.
    pub fn counter(self, path: impl Into<String>, delta: i64) -> ClientResult<Self> {
        if delta == 0 {
            return Err(ClientError::InvalidSpec("counter delta must be non-zero".into()));
        }
        self.push(path.into(), MutationKind::Counter, Bytes::from(delta.to_string()), 0)
    }

    /// Sets a new document expiry applied with the mutation.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Requires the document's current CAS to match.
    pub fn with_cas(mut self, cas: Cas) -> Self {
        self.cas = cas;
        self
    }

    /// Document key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// First appended spec.
    ///
    /// # Errors
    /// `EmptyBuilder` when nothing has been appended.
    pub fn first_spec(&self) -> ClientResult<&MutationSpec> {
        self.specs.first().ok_or(ClientError::EmptyBuilder)
    }

    /// Specs appended so far, in wire order.
    pub fn specs(&self) -> &[MutationSpec] {
        &self.specs
    }

    /// Number of specs appended so far.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Returns true when no spec has been appended.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Freezes the builder; see [`MutateIn::seal`].
    pub fn seal(self) -> ClientResult<MutateIn> {
        MutateIn::seal(self)
    }

    fn push(mut self, path: String, kind: MutationKind, value: Bytes, flags: u8) -> ClientResult<Self> {
        if path.is_empty() {
            return Err(ClientError::InvalidSpec("path must not be empty".into()));
        }
        if path.len() > MAX_PATH_LEN {
            return Err(ClientError::InvalidSpec(format!(
                "path of {} bytes exceeds {MAX_PATH_LEN}",
                path.len()
            )));
        }
        if kind.requires_value() && value.is_empty() {
            return Err(ClientError::InvalidSpec(format!("{kind:?} at {path:?} needs a value")));
        }
        if !kind.requires_value() && !value.is_empty() {
            return Err(ClientError::InvalidSpec(format!("{kind:?} at {path:?} takes no value")));
        }
        if self.specs.len() >= MAX_MUTATION_SPECS {
            return Err(ClientError::InvalidSpec(format!(
                "at most {MAX_MUTATION_SPECS} specs per document"
            )));
        }

        let order = self.specs.len();
        self.specs.push(MutationSpec {
            path,
            kind,
            value,
            flags,
            order,
        });
        Ok(self)
    }
}

/// Sealed, ordered snapshot of a builder's specs.
///
/// Cloning shares the spec list; nothing can append to it.
#[derive(Debug, Clone)]
pub struct MutateIn {
    key: Arc<str>,
    specs: Arc<[MutationSpec]>,
    expiry: Option<Duration>,
    cas: Cas,
}

impl MutateIn {
    /// Consumes an open builder.
    ///
    /// # Errors
    /// `EmptyBuilder` when the builder has no specs, and `InvalidArgument`
    /// when the key is empty.
    pub fn seal(builder: MutateInBuilder) -> ClientResult<Self> {
        if builder.key.is_empty() {
            return Err(ClientError::InvalidArgument("key must not be empty".into()));
        }
        if builder.specs.is_empty() {
            return Err(ClientError::EmptyBuilder);
        }
        Ok(MutateIn {
            key: Arc::from(builder.key),
            specs: Arc::from(builder.specs),
            expiry: builder.expiry,
            cas: builder.cas,
        })
    }

    /// Document key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// First spec; a sealed value always has one.
    pub fn first_spec(&self) -> &MutationSpec {
        &self.specs[0]
    }

    /// All specs in wire order.
    pub fn specs(&self) -> &[MutationSpec] {
        &self.specs
    }

    /// Returns true when the single-path fast path applies.
    pub fn is_single(&self) -> bool {
        self.specs.len() == 1
    }

    /// Requested document expiry.
    pub fn expiry(&self) -> Option<Duration> {
        self.expiry
    }

    /// Required CAS.
    pub fn cas(&self) -> Cas {
        self.cas
    }
}
