//! # Transcoders
//!
//! Convert application values to document bytes and back. The runtime only
//! calls the `Transcoder` contract; which format a document uses is the
//! caller's choice.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use cbkv_common::{DATATYPE_JSON, DATATYPE_RAW};

/// Common-flags value marking a JSON document.
pub const FLAGS_JSON: u32 = 0x0200_0000;

/// Common-flags value marking opaque binary content.
pub const FLAGS_BINARY: u32 = 0x0300_0000;

/// Transcoding failures.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("json transcoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document flags 0x{found:08x} do not match expected 0x{expected:08x}")]
    FlagsMismatch { expected: u32, found: u32 },
}

/// Encoded document body with the metadata stored alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Bytes,
    pub flags: u32,
    pub datatype: u8,
}

/// Value <-> bytes contract.
pub trait Transcoder<T>: Send + Sync {
    /// Encodes `value` for storage.
    fn encode(&self, value: &T) -> Result<Encoded, TranscodeError>;

    /// Decodes a stored document.
    fn decode(&self, bytes: &[u8], flags: u32) -> Result<T, TranscodeError>;
}

/// JSON documents via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTranscoder;

impl<T> Transcoder<T> for JsonTranscoder
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Encoded, TranscodeError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Encoded {
            bytes: Bytes::from(bytes),
            flags: FLAGS_JSON,
            datatype: DATATYPE_JSON,
        })
    }

    fn decode(&self, bytes: &[u8], _flags: u32) -> Result<T, TranscodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Opaque byte documents, passed through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTranscoder;

impl Transcoder<Bytes> for RawTranscoder {
    fn encode(&self, value: &Bytes) -> Result<Encoded, TranscodeError> {
        Ok(Encoded {
            bytes: value.clone(),
            flags: FLAGS_BINARY,
            datatype: DATATYPE_RAW,
        })
    }

    fn decode(&self, bytes: &[u8], flags: u32) -> Result<Bytes, TranscodeError> {
        if flags == FLAGS_JSON {
            return Err(TranscodeError::FlagsMismatch {
                expected: FLAGS_BINARY,
                found: flags,
            });
        }
        Ok(Bytes::copy_from_slice(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    #[test]
    fn test_json_encode_sets_flags_and_datatype() {
        let profile = Profile {
            name: "ada".into(),
            visits: 3,
        };
        let encoded = JsonTranscoder.encode(&profile).unwrap();
        assert_eq!(encoded.flags, FLAGS_JSON);
        assert_eq!(encoded.datatype, DATATYPE_JSON);

        let decoded: Profile = JsonTranscoder.decode(&encoded.bytes, encoded.flags).unwrap();
        assert_eq!(decoded, profile);
    }

    #[test]
    fn test_json_decode_reports_garbage() {
        let result: Result<Profile, _> = JsonTranscoder.decode(b"not json", FLAGS_JSON);
        assert!(matches!(result, Err(TranscodeError::Json(_))));
    }

    #[test]
    fn test_raw_rejects_json_documents() {
        let err = RawTranscoder.decode(b"{}", FLAGS_JSON).unwrap_err();
        assert!(matches!(err, TranscodeError::FlagsMismatch { .. }));
        let bytes = RawTranscoder.decode(b"\x00\x01", FLAGS_BINARY).unwrap();
        assert_eq!(bytes.as_ref(), b"\x00\x01");
    }
}
