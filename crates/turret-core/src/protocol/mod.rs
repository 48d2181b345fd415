//! Wire protocol for the turret gate sockets.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Message bodies (register/invoke/     │
//! │     result/error)                        │
//! ├─────────────────────────────────────────┤
//! │     Envelope (magic, type, principal,    │
//! │     ts, nonce, body, signature)          │
//! ├─────────────────────────────────────────┤
//! │     Framing (4-byte BE length prefix)    │
//! ├─────────────────────────────────────────┤
//! │     UDS transport                        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Wire Format
//!
//! Every frame is a 4-byte big-endian unsigned length followed by that many
//! payload bytes, capped at [`MAX_FRAME_SIZE`]. The payload is one envelope:
//! integer fields little-endian, byte strings (`bstr`) prefixed with a
//! big-endian `u32` length. Decoding fails closed: wrong magic, wrong
//! version, unknown message type, any under- or overrun, an oversized
//! `bstr`, or trailing bytes after the signature all reject the frame.
//!
//! # Security Considerations
//!
//! - Frame and `bstr` lengths are validated before allocation
//! - Signatures are exactly 64 bytes; anything else is rejected
//! - Decoding is strict so that re-encoding a decoded envelope reproduces
//!   the identical bytes

pub mod envelope;
pub mod error;
pub mod framing;

pub use envelope::{
    Envelope, ErrorBody, InvokeBody, MessageType, RegisterBody, ResultBody, ENVELOPE_MAGIC,
    MAX_REGISTER_ACTIONS, PROTOCOL_VERSION,
};
pub use error::{ErrorCode, ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use framing::FrameCodec;
