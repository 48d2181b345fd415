//! Protocol error types and wire-level limits.

use std::io;

/// Maximum frame payload size in bytes (256 KiB).
///
/// Applies to whole frames and to every `bstr` field inside an envelope.
/// Oversized lengths are rejected before any allocation occurs.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced by framing and envelope decoding.
///
/// Every variant except [`ProtocolError::Io`] maps onto the wire error code
/// [`ErrorCode::BadRequest`]; frame-size violations are fatal for the
/// connection that produced them.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Underlying transport error.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Frame length prefix exceeds the protocol limit.
    #[error("frame too large: {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum permitted size.
        max: usize,
    },

    /// Input ended before the named field was complete.
    #[error("truncated envelope: ran out of bytes reading {field}")]
    Truncated {
        /// Field being decoded when the input ran dry.
        field: &'static str,
    },

    /// A `bstr` length prefix exceeds the protocol limit.
    #[error("byte string too large: {len} bytes exceeds limit of {max}")]
    BstrTooLarge {
        /// Declared byte-string length.
        len: usize,
        /// Maximum permitted length.
        max: usize,
    },

    /// The envelope did not start with the expected magic.
    #[error("bad envelope magic")]
    BadMagic,

    /// Unsupported protocol version.
    #[error("unsupported protocol version {version}")]
    BadVersion {
        /// Version found on the wire.
        version: u16,
    },

    /// Message type discriminant outside the known set.
    #[error("unknown message type {value}")]
    UnknownMessageType {
        /// Discriminant found on the wire.
        value: u16,
    },

    /// Error code discriminant outside the known set.
    #[error("unknown error code {value}")]
    UnknownErrorCode {
        /// Discriminant found on the wire.
        value: u16,
    },

    /// Signature field was not exactly 64 bytes.
    #[error("bad signature length: {len} bytes, expected 64")]
    BadSignatureLength {
        /// Length found on the wire.
        len: usize,
    },

    /// Bytes remained after the final field of a message.
    #[error("{count} trailing bytes after {context}")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
        /// What was being decoded.
        context: &'static str,
    },

    /// A register body advertised more actions than permitted.
    #[error("register advertises {count} actions, limit is {max}")]
    TooManyActions {
        /// Declared action count.
        count: u32,
        /// Maximum permitted count.
        max: u32,
    },
}

/// Wire error codes carried in `error` bodies.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unknown principal, bad signature, or principal mismatch on a pinned
    /// connection.
    Unauthenticated = 1,
    /// Timestamp outside the tolerance window, or a duplicate nonce.
    Replay = 2,
    /// Permission refused, or a repeater claiming an action it does not own.
    Denied = 3,
    /// Action absent from the bunker.
    UnknownAction = 4,
    /// Mapped repeater not currently live.
    NoRepeater = 5,
    /// Malformed envelope, wrong message type for the connection class,
    /// duplicate request id, or an unknown pending request id.
    BadRequest = 6,
    /// Timeouts, resource exhaustion, or internal faults.
    Internal = 7,
}

impl ErrorCode {
    /// Decodes a wire discriminant.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownErrorCode`] for values outside 1..=7.
    pub fn from_wire(value: u16) -> ProtocolResult<Self> {
        match value {
            1 => Ok(Self::Unauthenticated),
            2 => Ok(Self::Replay),
            3 => Ok(Self::Denied),
            4 => Ok(Self::UnknownAction),
            5 => Ok(Self::NoRepeater),
            6 => Ok(Self::BadRequest),
            7 => Ok(Self::Internal),
            value => Err(ProtocolError::UnknownErrorCode { value }),
        }
    }

    /// Returns the wire discriminant.
    #[must_use]
    pub const fn as_wire(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Replay => "REPLAY",
            Self::Denied => "DENIED",
            Self::UnknownAction => "UNKNOWN_ACTION",
            Self::NoRepeater => "NO_REPEATER",
            Self::BadRequest => "BAD_REQUEST",
            Self::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_roundtrip() {
        for value in 1..=7u16 {
            let code = ErrorCode::from_wire(value).unwrap();
            assert_eq!(code.as_wire(), value);
        }
    }

    #[test]
    fn error_code_rejects_unknown() {
        assert!(matches!(
            ErrorCode::from_wire(0),
            Err(ProtocolError::UnknownErrorCode { value: 0 })
        ));
        assert!(matches!(
            ErrorCode::from_wire(8),
            Err(ProtocolError::UnknownErrorCode { value: 8 })
        ));
    }
}
