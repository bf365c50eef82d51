//! # CBKV Mock Node
//!
//! Purpose: In-memory node speaking the binary protocol, used by the client's
//! end-to-end tests and for local experiments.
//!
//! ## Design Principles
//! 1. **Same Framing as the Client**: Requests are decoded with the shared
//!    `cbkv-common` codec, so both sides agree on every byte.
//! 2. **Atomic Sub-Document Writes**: Multi-mutations commit all specs or
//!    none and report the first failing spec.
//! 3. **Test-Friendly Lifecycle**: `spawn_background` hands blocking tests a
//!    bound address and stops the server when the handle drops.

pub mod path;
pub mod server;
pub mod store;

pub use server::{dispatch, handle_connection, serve, spawn_background, ServerHandle};
pub use store::{Document, MutateError, MutateOutcome, PathMutation, Store};
