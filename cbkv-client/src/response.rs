//! # Responses
//!
//! Decoded server replies and the mapping from a reply's status to the
//! caller-facing result.

use bytes::Bytes;

use cbkv_common::{
    decode_mutation_failure, decode_mutation_results, Cas, Frame, MutationResult, Opcode, Status,
};

use crate::error::{ClientError, ClientResult};
use crate::transcoder::{TranscodeError, Transcoder};

/// One reply, matched to its request by correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    opcode: u8,
    status: Status,
    opaque: u32,
    cas: Cas,
    datatype: u8,
    extras: Bytes,
    key: Bytes,
    value: Bytes,
}

impl Response {
    /// Wraps a decoded response frame.
    pub fn from_frame(frame: Frame) -> Self {
        Response {
            opcode: frame.header.opcode,
            status: frame.status(),
            opaque: frame.opaque(),
            cas: Cas(frame.cas()),
            datatype: frame.header.datatype,
            extras: frame.extras,
            key: frame.key,
            value: frame.value,
        }
    }

    /// Raw opcode echoed by the server.
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Correlation id echoed by the server.
    pub fn correlation_id(&self) -> u32 {
        self.opaque
    }

    /// CAS of the document after the operation.
    pub fn cas(&self) -> Cas {
        self.cas
    }

    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    /// Document flags carried in the first four extras bytes, or 0.
    pub fn flags(&self) -> u32 {
        match self.extras.get(..4) {
            Some(raw) => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            None => 0,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Decodes the document value with `transcoder`.
    pub fn content<T>(&self, transcoder: &impl Transcoder<T>) -> Result<T, TranscodeError> {
        transcoder.decode(&self.value, self.flags())
    }

    /// Per-spec results of a successful multi-mutation.
    pub fn mutation_results(&self) -> ClientResult<Vec<MutationResult>> {
        Ok(decode_mutation_results(&self.value)?)
    }

    /// Converts a non-success status into the matching error.
    ///
    /// A multi-path failure is reported as `MutationFailed` with the index
    /// and status of the first failing spec.
    pub fn into_result(self, opcode: Opcode) -> ClientResult<Response> {
        match self.status {
            Status::Success => Ok(self),
            Status::SubdocMultiPathFailure => {
                let (index, status) = decode_mutation_failure(&self.value)?;
                Err(ClientError::MutationFailed {
                    index: index as usize,
                    status,
                })
            }
            status => Err(ClientError::Server { opcode, status }),
        }
    }
}
