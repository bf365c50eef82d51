// cbkv-common - Shared wire protocol definitions for the CBKV client runtime
//
// This crate defines the binary protocol framing (24-byte header + body)
// spoken between the client pool and cluster nodes, plus the sub-document
// payload layouts. It performs no I/O.

pub mod error;
pub mod protocol;
pub mod subdoc;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use subdoc::*;
pub use types::*;
