//! # Outpost Protocol
//!
//! Wire format shared by the outpost agent and its controller: length-prefixed
//! msgpack frames, loosely-typed inbound envelopes, outbound messages and the
//! record protocol spoken with sandboxed modules.

#![warn(missing_docs)]

/// Length-prefixed frame codec for async streams
pub mod codec;

/// Inbound envelopes and total field extraction
pub mod envelope;

/// Outbound message types
pub mod message;

/// Module protocol wire types
pub mod module;

/// Streaming decoder for module records
pub mod record;

/// Shared outbound sink
pub mod writer;

/// Error types for protocol operations
pub mod error;

/// Test helpers for envelopes and captured output
pub mod test_utils;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use envelope::{Envelope, Fields, Value};
pub use error::ProtocolError;
pub use message::Outbound;
pub use module::{HostInfo, ModuleAssets, ModuleManifest, ModuleMessage};
pub use record::RecordDecoder;
pub use writer::{FramedWriter, TransportWriter};
