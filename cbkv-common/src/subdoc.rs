//! # Sub-Document Payload Layouts
//!
//! Purpose: Describe how path-scoped mutations are laid out inside a frame,
//! for both the single-path commands and the multi-mutation command (0xd1).
//!
//! ## Memory Layout Example
//!
//! ```text
//! Single-path request:
//!   extras: | path len:2B | path flags:1B | [expiry:4B] |
//!   key:    document id
//!   value:  | path | fragment |
//!
//! Multi-mutation request value (one block per spec, in order):
//! +----------+---------+-------------+--------------+------+----------+
//! | opcode:1B| flags:1B| path len:2B | value len:4B | path | fragment |
//! +----------+---------+-------------+--------------+------+----------+
//!
//! Multi-mutation success value (only specs that return a value):
//! +---------+-----------+--------------+-------+
//! | index:1B| status:2B | value len:4B | value |
//! +---------+-----------+--------------+-------+
//!
//! Multi-mutation failure value (status SubdocMultiPathFailure):
//! +---------+-----------+
//! | index:1B| status:2B |
//! +---------+-----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{Opcode, Status};

/// Maximum number of specs in one multi-mutation.
pub const MAX_MUTATION_SPECS: usize = 16;

/// Maximum path length accepted by the server.
pub const MAX_PATH_LEN: usize = 1024;

/// Path flag: create missing intermediate objects/arrays.
pub const PATH_FLAG_CREATE_PARENTS: u8 = 0x01;

/// Fixed part of one multi-mutation request block.
pub const MUTATION_BLOCK_HEADER_LEN: usize = 8;

/// Kind of change applied at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    /// Add a dictionary entry; fails if it exists.
    Insert,
    /// Add or replace a dictionary entry.
    Upsert,
    /// Replace an existing value.
    Replace,
    /// Remove the value at the path.
    Delete,
    /// Push onto the end of an array.
    ArrayAppend,
    /// Push onto the front of an array.
    ArrayPrepend,
    /// Insert at an array index given by the path.
    ArrayInsert,
    /// Push onto an array unless the value is already present.
    ArrayAddUnique,
    /// Add a signed delta to a number.
    Counter,
}

impl MutationKind {
    /// Single-path opcode for this kind.
    pub const fn opcode(self) -> Opcode {
        match self {
            MutationKind::Insert => Opcode::SubdocDictAdd,
            MutationKind::Upsert => Opcode::SubdocDictUpsert,
            MutationKind::Replace => Opcode::SubdocReplace,
            MutationKind::Delete => Opcode::SubdocDelete,
            MutationKind::ArrayAppend => Opcode::SubdocArrayPushLast,
            MutationKind::ArrayPrepend => Opcode::SubdocArrayPushFirst,
            MutationKind::ArrayInsert => Opcode::SubdocArrayInsert,
            MutationKind::ArrayAddUnique => Opcode::SubdocArrayAddUnique,
            MutationKind::Counter => Opcode::SubdocCounter,
        }
    }

    /// Inverse of [`MutationKind::opcode`]; `None` for non-mutation opcodes.
    pub const fn from_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::SubdocDictAdd => Some(MutationKind::Insert),
            Opcode::SubdocDictUpsert => Some(MutationKind::Upsert),
            Opcode::SubdocReplace => Some(MutationKind::Replace),
            Opcode::SubdocDelete => Some(MutationKind::Delete),
            Opcode::SubdocArrayPushLast => Some(MutationKind::ArrayAppend),
            Opcode::SubdocArrayPushFirst => Some(MutationKind::ArrayPrepend),
            Opcode::SubdocArrayInsert => Some(MutationKind::ArrayInsert),
            Opcode::SubdocArrayAddUnique => Some(MutationKind::ArrayAddUnique),
            Opcode::SubdocCounter => Some(MutationKind::Counter),
            _ => None,
        }
    }

    /// Delete is the only kind sent without a fragment.
    #[inline]
    pub const fn requires_value(self) -> bool {
        !matches!(self, MutationKind::Delete)
    }

    /// Counter is the only kind whose result carries a value.
    #[inline]
    pub const fn returns_value(self) -> bool {
        matches!(self, MutationKind::Counter)
    }
}

/// Extras of a single-path command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinglePathExtras {
    pub path_len: u16,
    pub flags: u8,
    pub expiry: Option<u32>,
}

impl SinglePathExtras {
    /// Encodes into a stack buffer; returns the buffer and the used length
    /// (3 without expiry, 7 with).
    pub fn encode(&self) -> ([u8; 7], usize) {
        let mut buf = [0u8; 7];
        buf[..2].copy_from_slice(&self.path_len.to_be_bytes());
        buf[2] = self.flags;
        match self.expiry {
            Some(expiry) => {
                buf[3..7].copy_from_slice(&expiry.to_be_bytes());
                (buf, 7)
            }
            None => (buf, 3),
        }
    }

    /// Parses 3- or 7-byte extras.
    pub fn decode(mut extras: &[u8]) -> ProtocolResult<Self> {
        if extras.len() != 3 && extras.len() != 7 {
            return Err(ProtocolError::Truncated("single-path extras"));
        }
        let path_len = extras.get_u16();
        let flags = extras.get_u8();
        let expiry = if extras.remaining() == 4 {
            Some(extras.get_u32())
        } else {
            None
        };
        Ok(SinglePathExtras {
            path_len,
            flags,
            expiry,
        })
    }
}

/// Appends one multi-mutation request block.
pub fn encode_mutation_block(
    out: &mut BytesMut,
    opcode: Opcode,
    flags: u8,
    path: &[u8],
    value: &[u8],
) -> ProtocolResult<()> {
    if path.len() > u16::MAX as usize {
        return Err(ProtocolError::PathTooLong(path.len()));
    }
    out.reserve(MUTATION_BLOCK_HEADER_LEN + path.len() + value.len());
    out.put_u8(opcode.as_u8());
    out.put_u8(flags);
    out.put_u16(path.len() as u16);
    out.put_u32(value.len() as u32);
    out.put_slice(path);
    out.put_slice(value);
    Ok(())
}

/// One decoded multi-mutation request block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBlock {
    pub opcode: Opcode,
    pub flags: u8,
    pub path: Bytes,
    pub value: Bytes,
}

/// Splits a multi-mutation request value into its blocks, preserving order.
pub fn decode_mutation_blocks(value: &Bytes) -> ProtocolResult<Vec<MutationBlock>> {
    let mut rest = value.clone();
    let mut blocks = Vec::new();
    while rest.has_remaining() {
        if rest.remaining() < MUTATION_BLOCK_HEADER_LEN {
            return Err(ProtocolError::Truncated("mutation block header"));
        }
        let opcode = Opcode::try_from(rest.get_u8())?;
        let flags = rest.get_u8();
        let path_len = rest.get_u16() as usize;
        let value_len = rest.get_u32() as usize;
        if rest.remaining() < path_len + value_len {
            return Err(ProtocolError::Truncated("mutation block body"));
        }
        let path = rest.split_to(path_len);
        let value = rest.split_to(value_len);
        blocks.push(MutationBlock {
            opcode,
            flags,
            path,
            value,
        });
    }
    Ok(blocks)
}

/// One per-spec entry of a multi-mutation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    /// Position of the spec in the request.
    pub index: u8,
    pub status: Status,
    pub value: Bytes,
}

/// Appends a success-result entry.
pub fn encode_mutation_result(out: &mut BytesMut, index: u8, status: Status, value: &[u8]) {
    out.reserve(7 + value.len());
    out.put_u8(index);
    out.put_u16(status.as_u16());
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

/// Decodes the value of a successful multi-mutation response.
pub fn decode_mutation_results(value: &Bytes) -> ProtocolResult<Vec<MutationResult>> {
    let mut rest = value.clone();
    let mut results = Vec::new();
    while rest.has_remaining() {
        if rest.remaining() < 7 {
            return Err(ProtocolError::Truncated("mutation result header"));
        }
        let index = rest.get_u8();
        let status = Status::from_u16(rest.get_u16());
        let len = rest.get_u32() as usize;
        if rest.remaining() < len {
            return Err(ProtocolError::Truncated("mutation result value"));
        }
        results.push(MutationResult {
            index,
            status,
            value: rest.split_to(len),
        });
    }
    Ok(results)
}

/// Appends the 3-byte failure entry.
pub fn encode_mutation_failure(out: &mut BytesMut, index: u8, status: Status) {
    out.put_u8(index);
    out.put_u16(status.as_u16());
}

/// Decodes the value of a `SubdocMultiPathFailure` response.
pub fn decode_mutation_failure(mut value: &[u8]) -> ProtocolResult<(u8, Status)> {
    if value.len() < 3 {
        return Err(ProtocolError::Truncated("mutation failure"));
    }
    let index = value.get_u8();
    let status = Status::from_u16(value.get_u16());
    Ok((index, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_opcode_mapping_is_bijective() {
        let kinds = [
            MutationKind::Insert,
            MutationKind::Upsert,
            MutationKind::Replace,
            MutationKind::Delete,
            MutationKind::ArrayAppend,
            MutationKind::ArrayPrepend,
            MutationKind::ArrayInsert,
            MutationKind::ArrayAddUnique,
            MutationKind::Counter,
        ];
        for kind in kinds {
            assert_eq!(MutationKind::from_opcode(kind.opcode()), Some(kind));
        }
        assert_eq!(MutationKind::Delete.opcode(), Opcode::SubdocDelete);
        assert_eq!(MutationKind::from_opcode(Opcode::SubdocGet), None);
    }

    #[test]
    fn test_single_path_extras_with_and_without_expiry() {
        let (buf, len) = SinglePathExtras {
            path_len: 5,
            flags: PATH_FLAG_CREATE_PARENTS,
            expiry: None,
        }
        .encode();
        assert_eq!(&buf[..len], &[0, 5, 1]);

        let extras = SinglePathExtras {
            path_len: 2,
            flags: 0,
            expiry: Some(60),
        };
        let (buf, len) = extras.encode();
        assert_eq!(&buf[..len], &[0, 2, 0, 0, 0, 0, 60]);
        assert_eq!(SinglePathExtras::decode(&buf[..len]).unwrap(), extras);
        assert!(SinglePathExtras::decode(&buf[..4]).is_err());
    }

    #[test]
    fn test_mutation_blocks_keep_order() {
        let mut out = BytesMut::new();
        encode_mutation_block(&mut out, Opcode::SubdocDelete, 0, b"a", b"").unwrap();
        encode_mutation_block(&mut out, Opcode::SubdocDictAdd, 0, b"b", b"\"v\"").unwrap();
        assert_eq!(&out[..MUTATION_BLOCK_HEADER_LEN], &[0xc9, 0, 0, 1, 0, 0, 0, 0]);

        let blocks = decode_mutation_blocks(&out.freeze()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(&blocks[0].path[..], b"a");
        assert_eq!(blocks[1].opcode, Opcode::SubdocDictAdd);
        assert_eq!(&blocks[1].value[..], b"\"v\"");
    }

    #[test]
    fn test_truncated_block_is_rejected() {
        let mut out = BytesMut::new();
        encode_mutation_block(&mut out, Opcode::SubdocDictUpsert, 0, b"path", b"1").unwrap();
        out.truncate(out.len() - 1);
        assert_eq!(
            decode_mutation_blocks(&out.freeze()),
            Err(ProtocolError::Truncated("mutation block body"))
        );
    }

    #[test]
    fn test_results_and_failure_decode() {
        let mut out = BytesMut::new();
        encode_mutation_result(&mut out, 2, Status::Success, b"11");
        let results = decode_mutation_results(&out.freeze()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 2);
        assert_eq!(&results[0].value[..], b"11");

        let mut out = BytesMut::new();
        encode_mutation_failure(&mut out, 1, Status::SubdocPathExists);
        assert_eq!(
            decode_mutation_failure(&out).unwrap(),
            (1, Status::SubdocPathExists)
        );
    }
}
