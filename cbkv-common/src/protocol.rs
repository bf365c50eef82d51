//! # Binary Protocol Framing
//!
//! Purpose: Encode and decode the fixed 24-byte header + body frames used by
//! the key-value service, for both requests (client -> node) and responses
//! (node -> client).
//!
//! ## Design Principles
//!
//! 1. **Bit-Exact Layout**: Field widths and offsets are the compatibility
//!    surface with the server; all integers are big-endian.
//! 2. **Streaming Decode**: `decode_frame` consumes complete frames from a
//!    growing `BytesMut` and leaves partial input untouched.
//! 3. **Zero-Copy Bodies**: Decoded extras/key/value are `Bytes` slices of the
//!    read buffer, not fresh allocations.
//! 4. **Validate Before Trusting**: Lengths are checked against each other and
//!    against a frame cap before any body bytes are sliced.
//!
//! ## Memory Layout Example
//!
//! ```text
//! Header (24 bytes total):
//! +--------+--------+------------+
//! | magic  | opcode | key len    |
//! | 1B     | 1B     | 2B         |
//! +--------+--------+------------+
//! | extras | data   | vbucket /  |
//! | len 1B | type 1B| status 2B  |
//! +--------+--------+------------+
//! | total body length 4B         |
//! +------------------------------+
//! | opaque (correlation id) 4B   |
//! +------------------------------+
//! | CAS 8B                       |
//! +------------------------------+
//!
//! Body:
//! +-----------+---------+-----------+
//! | extras    | key     | value     |
//! +-----------+---------+-----------+
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Fixed header length for every frame.
pub const HEADER_LEN: usize = 24;

/// Magic byte opening a request frame.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte opening a response frame.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Data type: opaque bytes.
pub const DATATYPE_RAW: u8 = 0x00;

/// Data type bit: value is JSON.
pub const DATATYPE_JSON: u8 = 0x01;

/// Maximum key length accepted by the server.
pub const MAX_KEY_LEN: usize = 250;

/// Largest body accepted in one frame (20 MiB document + headroom).
pub const MAX_BODY_LEN: u32 = 20 * 1024 * 1024 + 4096;

/// Command codes understood by this implementation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Delete = 0x04,
    Noop = 0x0a,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    Sync = 0x96,
    SubdocGet = 0xc5,
    SubdocExists = 0xc6,
    SubdocDictAdd = 0xc7,
    SubdocDictUpsert = 0xc8,
    SubdocDelete = 0xc9,
    SubdocReplace = 0xca,
    SubdocArrayPushLast = 0xcb,
    SubdocArrayPushFirst = 0xcc,
    SubdocArrayInsert = 0xcd,
    SubdocArrayAddUnique = 0xce,
    SubdocCounter = 0xcf,
    SubdocMultiLookup = 0xd0,
    SubdocMultiMutation = 0xd1,
}

impl Opcode {
    /// Returns the raw opcode byte.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true for sub-document commands (0xc5..=0xd1).
    #[inline]
    pub const fn is_subdoc(self) -> bool {
        let raw = self as u8;
        raw >= 0xc5 && raw <= 0xd1
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let opcode = match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x04 => Opcode::Delete,
            0x0a => Opcode::Noop,
            0x1c => Opcode::Touch,
            0x1d => Opcode::GetAndTouch,
            0x96 => Opcode::Sync,
            0xc5 => Opcode::SubdocGet,
            0xc6 => Opcode::SubdocExists,
            0xc7 => Opcode::SubdocDictAdd,
            0xc8 => Opcode::SubdocDictUpsert,
            0xc9 => Opcode::SubdocDelete,
            0xca => Opcode::SubdocReplace,
            0xcb => Opcode::SubdocArrayPushLast,
            0xcc => Opcode::SubdocArrayPushFirst,
            0xcd => Opcode::SubdocArrayInsert,
            0xce => Opcode::SubdocArrayAddUnique,
            0xcf => Opcode::SubdocCounter,
            0xd0 => Opcode::SubdocMultiLookup,
            0xd1 => Opcode::SubdocMultiMutation,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(opcode)
    }
}

/// Response status codes.
///
/// Unrecognised codes are preserved in `Other` so callers can still report
/// them verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    DeltaBadValue,
    NotMyVbucket,
    AuthError,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    SubdocPathNotFound,
    SubdocPathMismatch,
    SubdocPathInvalid,
    SubdocPathTooBig,
    SubdocDocTooDeep,
    SubdocValueCantInsert,
    SubdocDocNotJson,
    SubdocNumRange,
    SubdocDeltaRange,
    SubdocPathExists,
    SubdocValueTooDeep,
    SubdocInvalidCombo,
    SubdocMultiPathFailure,
    Other(u16),
}

impl Status {
    /// Decodes the two-byte status field.
    pub const fn from_u16(value: u16) -> Self {
        match value {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::DeltaBadValue,
            0x0007 => Status::NotMyVbucket,
            0x0020 => Status::AuthError,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            0x00c0 => Status::SubdocPathNotFound,
            0x00c1 => Status::SubdocPathMismatch,
            0x00c2 => Status::SubdocPathInvalid,
            0x00c3 => Status::SubdocPathTooBig,
            0x00c4 => Status::SubdocDocTooDeep,
            0x00c5 => Status::SubdocValueCantInsert,
            0x00c6 => Status::SubdocDocNotJson,
            0x00c7 => Status::SubdocNumRange,
            0x00c8 => Status::SubdocDeltaRange,
            0x00c9 => Status::SubdocPathExists,
            0x00ca => Status::SubdocValueTooDeep,
            0x00cb => Status::SubdocInvalidCombo,
            0x00cc => Status::SubdocMultiPathFailure,
            other => Status::Other(other),
        }
    }

    /// Encodes the status for the header field.
    pub const fn as_u16(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::DeltaBadValue => 0x0006,
            Status::NotMyVbucket => 0x0007,
            Status::AuthError => 0x0020,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::NotSupported => 0x0083,
            Status::InternalError => 0x0084,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::SubdocPathNotFound => 0x00c0,
            Status::SubdocPathMismatch => 0x00c1,
            Status::SubdocPathInvalid => 0x00c2,
            Status::SubdocPathTooBig => 0x00c3,
            Status::SubdocDocTooDeep => 0x00c4,
            Status::SubdocValueCantInsert => 0x00c5,
            Status::SubdocDocNotJson => 0x00c6,
            Status::SubdocNumRange => 0x00c7,
            Status::SubdocDeltaRange => 0x00c8,
            Status::SubdocPathExists => 0x00c9,
            Status::SubdocValueTooDeep => 0x00ca,
            Status::SubdocInvalidCombo => 0x00cb,
            Status::SubdocMultiPathFailure => 0x00cc,
            Status::Other(code) => code,
        }
    }

    /// Returns true for `Success`.
    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04x})", self, self.as_u16())
    }
}

/// Decoded 24-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Request or response magic.
    pub magic: u8,
    /// Raw opcode byte.
    pub opcode: u8,
    /// Key length in bytes.
    pub key_len: u16,
    /// Extras length in bytes.
    pub extras_len: u8,
    /// Data type flags.
    pub datatype: u8,
    /// vBucket id on requests, status on responses.
    pub vbucket_or_status: u16,
    /// Extras + key + value length.
    pub body_len: u32,
    /// Correlation id echoed by the server.
    pub opaque: u32,
    /// CAS token.
    pub cas: u64,
}

impl Header {
    /// Writes the header in wire order.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u8(self.magic);
        out.put_u8(self.opcode);
        out.put_u16(self.key_len);
        out.put_u8(self.extras_len);
        out.put_u8(self.datatype);
        out.put_u16(self.vbucket_or_status);
        out.put_u32(self.body_len);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
    }

    /// Parses a header from the first `HEADER_LEN` bytes of `data`.
    ///
    /// # Errors
    /// - `Truncated` when fewer than 24 bytes are available.
    /// - `InvalidMagic` for anything other than request/response magic.
    /// - `BodyTooLarge` / `InconsistentLengths` for impossible length fields.
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated("header"));
        }
        let mut cursor = &data[..HEADER_LEN];
        let header = Header {
            magic: cursor.get_u8(),
            opcode: cursor.get_u8(),
            key_len: cursor.get_u16(),
            extras_len: cursor.get_u8(),
            datatype: cursor.get_u8(),
            vbucket_or_status: cursor.get_u16(),
            body_len: cursor.get_u32(),
            opaque: cursor.get_u32(),
            cas: cursor.get_u64(),
        };

        if header.magic != REQUEST_MAGIC && header.magic != RESPONSE_MAGIC {
            return Err(ProtocolError::InvalidMagic(header.magic));
        }
        if header.body_len > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge(header.body_len));
        }
        if header.extras_len as u32 + header.key_len as u32 > header.body_len {
            return Err(ProtocolError::InconsistentLengths {
                body: header.body_len,
                extras: header.extras_len,
                key: header.key_len,
            });
        }
        Ok(header)
    }

    /// Length of the value section implied by the length fields.
    #[inline]
    pub fn value_len(&self) -> usize {
        self.body_len as usize - self.extras_len as usize - self.key_len as usize
    }
}

/// Borrowed view of a request about to be written.
#[derive(Debug, Clone, Copy)]
pub struct RequestFrame<'a> {
    pub opcode: Opcode,
    pub datatype: u8,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: &'a [u8],
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl RequestFrame<'_> {
    /// Total encoded size (header + body).
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Appends the frame to `out`.
    ///
    /// # Errors
    /// Rejects keys above `MAX_KEY_LEN`, extras above 255 bytes and bodies
    /// above `MAX_BODY_LEN`; nothing is written in that case.
    pub fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        encode_frame(
            out,
            REQUEST_MAGIC,
            self.opcode.as_u8(),
            self.datatype,
            self.vbucket,
            self.opaque,
            self.cas,
            self.extras,
            self.key,
            self.value,
        )
    }
}

/// Borrowed view of a response about to be written (used by nodes and fakes).
#[derive(Debug, Clone, Copy)]
pub struct ResponseFrame<'a> {
    pub opcode: u8,
    pub datatype: u8,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: &'a [u8],
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> ResponseFrame<'a> {
    /// Header-only response carrying just a status.
    pub fn status_only(opcode: u8, status: Status, opaque: u32) -> Self {
        ResponseFrame {
            opcode,
            datatype: DATATYPE_RAW,
            status,
            opaque,
            cas: 0,
            extras: &[],
            key: &[],
            value: &[],
        }
    }

    /// Appends the frame to `out`.
    pub fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        encode_frame(
            out,
            RESPONSE_MAGIC,
            self.opcode,
            self.datatype,
            self.status.as_u16(),
            self.opaque,
            self.cas,
            self.extras,
            self.key,
            self.value,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_frame(
    out: &mut BytesMut,
    magic: u8,
    opcode: u8,
    datatype: u8,
    vbucket_or_status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> ProtocolResult<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(ProtocolError::KeyTooLong(key.len()));
    }
    if extras.len() > u8::MAX as usize {
        return Err(ProtocolError::ExtrasTooLong(extras.len()));
    }
    let body_len = extras.len() + key.len() + value.len();
    if body_len > MAX_BODY_LEN as usize {
        return Err(ProtocolError::BodyTooLarge(body_len.min(u32::MAX as usize) as u32));
    }

    let header = Header {
        magic,
        opcode,
        key_len: key.len() as u16,
        extras_len: extras.len() as u8,
        datatype,
        vbucket_or_status,
        body_len: body_len as u32,
        opaque,
        cas,
    };
    out.reserve(HEADER_LEN + body_len);
    header.encode(out);
    out.put_slice(extras);
    out.put_slice(key);
    out.put_slice(value);
    Ok(())
}

/// Fully received frame; body sections share the read buffer's allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    /// Parsed opcode.
    pub fn opcode(&self) -> ProtocolResult<Opcode> {
        Opcode::try_from(self.header.opcode)
    }

    /// Status field (meaningful on responses).
    #[inline]
    pub fn status(&self) -> Status {
        Status::from_u16(self.header.vbucket_or_status)
    }

    /// vBucket field (meaningful on requests).
    #[inline]
    pub fn vbucket(&self) -> u16 {
        self.header.vbucket_or_status
    }

    /// Correlation id.
    #[inline]
    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    /// CAS token.
    #[inline]
    pub fn cas(&self) -> u64 {
        self.header.cas
    }
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame; the
/// buffer is left untouched so more bytes can be appended.
///
/// # Errors
/// Header validation errors, or `InvalidMagic` when the frame's magic does not
/// match `expected_magic`. The stream is unusable after an error.
pub fn decode_frame(buf: &mut BytesMut, expected_magic: u8) -> ProtocolResult<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = Header::decode(&buf[..HEADER_LEN])?;
    if header.magic != expected_magic {
        return Err(ProtocolError::InvalidMagic(header.magic));
    }

    let total = HEADER_LEN + header.body_len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let mut body = buf.split_to(total).freeze();
    body.advance(HEADER_LEN);
    let extras = body.split_to(header.extras_len as usize);
    let key = body.split_to(header.key_len as usize);
    Ok(Some(Frame {
        header,
        extras,
        key,
        value: body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> BytesMut {
        let mut out = BytesMut::new();
        RequestFrame {
            opcode: Opcode::Touch,
            datatype: DATATYPE_RAW,
            vbucket: 0x0203,
            opaque: 0xdead_beef,
            cas: 7,
            extras: &[0, 0, 0, 60],
            key: b"key",
            value: b"",
        }
        .encode(&mut out)
        .unwrap();
        out
    }

    #[test]
    fn test_request_header_layout() {
        let out = sample_request();
        assert_eq!(out.len(), HEADER_LEN + 4 + 3);
        assert_eq!(out[0], REQUEST_MAGIC);
        assert_eq!(out[1], 0x1c);
        assert_eq!(&out[2..4], &[0, 3]);
        assert_eq!(out[4], 4);
        assert_eq!(out[5], DATATYPE_RAW);
        assert_eq!(&out[6..8], &[0x02, 0x03]);
        assert_eq!(&out[8..12], &[0, 0, 0, 7]);
        assert_eq!(&out[12..16], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&out[16..24], &[0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(&out[24..28], &[0, 0, 0, 60]);
        assert_eq!(&out[28..], b"key");
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let full = sample_request();
        let mut partial = BytesMut::from(&full[..HEADER_LEN + 2]);
        assert_eq!(decode_frame(&mut partial, REQUEST_MAGIC).unwrap(), None);
        assert_eq!(partial.len(), HEADER_LEN + 2);

        partial.extend_from_slice(&full[HEADER_LEN + 2..]);
        let frame = decode_frame(&mut partial, REQUEST_MAGIC).unwrap().unwrap();
        assert!(partial.is_empty());
        assert_eq!(frame.opcode().unwrap(), Opcode::Touch);
        assert_eq!(frame.vbucket(), 0x0203);
        assert_eq!(frame.opaque(), 0xdead_beef);
        assert_eq!(&frame.extras[..], &[0, 0, 0, 60]);
        assert_eq!(&frame.key[..], b"key");
        assert!(frame.value.is_empty());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        ResponseFrame::status_only(0x0a, Status::Success, 1)
            .encode(&mut buf)
            .unwrap();
        ResponseFrame::status_only(0x0a, Status::KeyNotFound, 2)
            .encode(&mut buf)
            .unwrap();

        let first = decode_frame(&mut buf, RESPONSE_MAGIC).unwrap().unwrap();
        let second = decode_frame(&mut buf, RESPONSE_MAGIC).unwrap().unwrap();
        assert_eq!((first.opaque(), first.status()), (1, Status::Success));
        assert_eq!((second.opaque(), second.status()), (2, Status::KeyNotFound));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_wrong_magic() {
        let mut buf = sample_request();
        let err = decode_frame(&mut buf, RESPONSE_MAGIC).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidMagic(REQUEST_MAGIC));
    }

    #[test]
    fn test_header_rejects_inconsistent_lengths() {
        let mut buf = sample_request();
        // Claim a 10-byte key inside a 7-byte body.
        buf[2] = 0;
        buf[3] = 10;
        let err = Header::decode(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InconsistentLengths { .. }));
    }

    #[test]
    fn test_encode_rejects_long_key() {
        let key = vec![b'k'; MAX_KEY_LEN + 1];
        let mut out = BytesMut::new();
        let err = RequestFrame {
            opcode: Opcode::Get,
            datatype: DATATYPE_RAW,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: &[],
            key: &key,
            value: &[],
        }
        .encode(&mut out)
        .unwrap_err();
        assert_eq!(err, ProtocolError::KeyTooLong(MAX_KEY_LEN + 1));
        assert!(out.is_empty());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::from_u16(0x00cc), Status::SubdocMultiPathFailure);
        assert_eq!(Status::SubdocPathExists.as_u16(), 0x00c9);
        assert_eq!(Status::from_u16(0x1234), Status::Other(0x1234));
        assert_eq!(Status::Other(0x1234).as_u16(), 0x1234);
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::try_from(0xc9).unwrap(), Opcode::SubdocDelete);
        assert_eq!(Opcode::SubdocMultiMutation.as_u8(), 0xd1);
        assert!(Opcode::SubdocCounter.is_subdoc());
        assert!(!Opcode::Touch.is_subdoc());
        assert_eq!(Opcode::try_from(0x42), Err(ProtocolError::UnknownOpcode(0x42)));
    }
}
