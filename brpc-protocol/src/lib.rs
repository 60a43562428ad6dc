//! # brpc-protocol
//!
//! Wire protocol implementation for brpc.
//!
//! A connection carries one JSON handshake line followed by alternating
//! header and body frames:
//!
//! ```text
//! [Options\n][Header][Body][Header][Body]...
//! ```
//!
//! This crate provides:
//! - The `Options` handshake record and the per-call `Header`
//! - Binary framing with length prefix and CRC32C validation
//! - Pluggable body codecs selected by content-type tag
//! - Framed reader/writer halves over any async byte stream

pub mod codec;
pub mod error;
pub mod frame;
pub mod framed;
pub mod message;

pub use codec::{Codec, CodecRegistry, CborCodec, JsonCodec, CBOR, JSON};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use framed::{read_options, write_options, FrameReader, FrameWriter};
pub use message::{Header, Options, MAGIC_NUMBER};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for brpc servers.
pub const DEFAULT_PORT: u16 = 9999;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum length of the handshake line (64 KiB).
pub const MAX_OPTIONS_LEN: usize = 64 * 1024;
