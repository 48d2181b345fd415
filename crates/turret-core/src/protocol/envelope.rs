//! Envelope and message-body codecs.
//!
//! An envelope is the unit carried inside one frame:
//!
//! ```text
//! magic[4]="TRT1"  version:u16  type:u16  principal:bstr
//! ts_ms:u64        nonce:bstr   body:bstr sig:bstr(64)
//! ```
//!
//! Integer fields are little-endian; `bstr` is a big-endian `u32` length
//! followed by that many raw bytes. Decoding is strict: every length is
//! bounds-checked against both [`MAX_FRAME_SIZE`] and the remaining input,
//! the signature must be exactly 64 bytes, and trailing bytes after the
//! final field reject the message. Strictness makes the encoding canonical:
//! re-encoding any decoded value reproduces the input bytes.

use bytes::BufMut;

use super::error::{ErrorCode, ProtocolError, ProtocolResult, MAX_FRAME_SIZE};

/// Magic prefix identifying a turret envelope.
pub const ENVELOPE_MAGIC: &[u8; 4] = b"TRT1";

/// Wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum number of action names one register body may advertise.
pub const MAX_REGISTER_ACTIONS: u32 = 1024;

/// Envelope signature length in bytes.
const SIG_LEN: usize = 64;

/// Message type discriminants.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Repeater advertises the actions it implements.
    Register = 1,
    /// Agent requests execution of an action.
    Invoke = 2,
    /// Repeater returns a successful result.
    Result = 3,
    /// Either side reports a failure.
    Error = 4,
}

impl MessageType {
    fn from_wire(value: u16) -> ProtocolResult<Self> {
        match value {
            1 => Ok(Self::Register),
            2 => Ok(Self::Invoke),
            3 => Ok(Self::Result),
            4 => Ok(Self::Error),
            value => Err(ProtocolError::UnknownMessageType { value }),
        }
    }
}

/// A decoded envelope.
///
/// `principal`, `nonce`, and `body` are the exact bytes from the wire; the
/// canonical signing bytes are built from these without re-encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Message type.
    pub msg_type: MessageType,
    /// Sender principal id (raw bytes, usually UTF-8).
    pub principal: Vec<u8>,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub ts_ms: u64,
    /// Anti-replay nonce, unique per principal within the window.
    pub nonce: Vec<u8>,
    /// Encoded message body.
    pub body: Vec<u8>,
    /// Ed25519 signature over the canonical signing bytes.
    pub sig: [u8; SIG_LEN],
}

/// Strict cursor over an input slice.
///
/// All reads are explicit-length with underrun checks; nothing panics on
/// hostile input.
struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    fn remaining(&self) -> usize {
        self.input.len()
    }

    fn take(&mut self, len: usize, field: &'static str) -> ProtocolResult<&'a [u8]> {
        if self.input.len() < len {
            return Err(ProtocolError::Truncated { field });
        }
        let (head, rest) = self.input.split_at(len);
        self.input = rest;
        Ok(head)
    }

    fn u16_le(&mut self, field: &'static str) -> ProtocolResult<u16> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32_le(&mut self, field: &'static str) -> ProtocolResult<u32> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_le(&mut self, field: &'static str) -> ProtocolResult<u64> {
        let bytes = self.take(8, field)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn bstr(&mut self, field: &'static str) -> ProtocolResult<Vec<u8>> {
        let len_bytes = self.take(4, field)?;
        let len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::BstrTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(self.take(len, field)?.to_vec())
    }

    fn finish(self, context: &'static str) -> ProtocolResult<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::TrailingBytes {
                count: self.remaining(),
                context,
            });
        }
        Ok(())
    }
}

fn put_bstr(out: &mut Vec<u8>, bytes: &[u8]) -> ProtocolResult<()> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::BstrTooLarge {
            len: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    #[allow(clippy::cast_possible_truncation)] // validated above
    out.put_u32(bytes.len() as u32);
    out.extend_from_slice(bytes);
    Ok(())
}

impl Envelope {
    /// Decodes one envelope from a complete frame payload.
    ///
    /// # Errors
    ///
    /// Fails closed on wrong magic, wrong version, unknown message type,
    /// under/overrun, oversized byte strings, a signature that is not
    /// exactly 64 bytes, or trailing bytes after the signature.
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(payload);

        let magic = reader.take(4, "magic")?;
        if magic != ENVELOPE_MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        let version = reader.u16_le("version")?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion { version });
        }

        let msg_type = MessageType::from_wire(reader.u16_le("type")?)?;
        let principal = reader.bstr("principal")?;
        let ts_ms = reader.u64_le("ts_ms")?;
        let nonce = reader.bstr("nonce")?;
        let body = reader.bstr("body")?;
        let sig_bytes = reader.bstr("sig")?;
        if sig_bytes.len() != SIG_LEN {
            return Err(ProtocolError::BadSignatureLength {
                len: sig_bytes.len(),
            });
        }
        reader.finish("envelope")?;

        let mut sig = [0u8; SIG_LEN];
        sig.copy_from_slice(&sig_bytes);

        Ok(Self {
            msg_type,
            principal,
            ts_ms,
            nonce,
            body,
            sig,
        })
    }

    /// Encodes the envelope into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BstrTooLarge`] if any byte-string field
    /// exceeds [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::with_capacity(
            4 + 2 + 2 + 8 + 16 + self.principal.len() + self.nonce.len() + self.body.len() + SIG_LEN,
        );
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.put_u16_le(PROTOCOL_VERSION);
        out.put_u16_le(self.msg_type as u16);
        put_bstr(&mut out, &self.principal)?;
        out.put_u64_le(self.ts_ms);
        put_bstr(&mut out, &self.nonce)?;
        put_bstr(&mut out, &self.body)?;
        put_bstr(&mut out, &self.sig)?;
        Ok(out)
    }

    /// Returns the envelope signature as a dalek type.
    #[must_use]
    pub fn signature(&self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.sig)
    }
}

/// Body of a `register` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterBody {
    /// Id the repeater claims; must match the envelope principal.
    pub repeater_id: Vec<u8>,
    /// Action names the repeater implements.
    pub actions: Vec<Vec<u8>>,
}

impl RegisterBody {
    /// Decodes a register body.
    pub fn decode(body: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(body);
        let repeater_id = reader.bstr("repeater_id")?;
        let action_count = reader.u32_le("action_count")?;
        if action_count > MAX_REGISTER_ACTIONS {
            return Err(ProtocolError::TooManyActions {
                count: action_count,
                max: MAX_REGISTER_ACTIONS,
            });
        }
        // Each action costs at least a 4-byte length prefix; checking up
        // front keeps a lying count from driving a large preallocation.
        if (action_count as usize) * 4 > reader.remaining() {
            return Err(ProtocolError::Truncated { field: "actions" });
        }
        let mut actions = Vec::with_capacity(action_count as usize);
        for _ in 0..action_count {
            actions.push(reader.bstr("action")?);
        }
        reader.finish("register body")?;
        Ok(Self {
            repeater_id,
            actions,
        })
    }

    /// Encodes the body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        put_bstr(&mut out, &self.repeater_id)?;
        let count = u32::try_from(self.actions.len()).unwrap_or(u32::MAX);
        if count > MAX_REGISTER_ACTIONS {
            return Err(ProtocolError::TooManyActions {
                count,
                max: MAX_REGISTER_ACTIONS,
            });
        }
        out.put_u32_le(count);
        for action in &self.actions {
            put_bstr(&mut out, action)?;
        }
        Ok(out)
    }
}

/// Body of an `invoke` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvokeBody {
    /// Correlation id, unique per agent connection.
    pub request_id: Vec<u8>,
    /// Action name to execute.
    pub action: Vec<u8>,
    /// Opaque parameters forwarded verbatim to the repeater.
    pub params: Vec<u8>,
}

impl InvokeBody {
    /// Decodes an invoke body.
    pub fn decode(body: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(body);
        let decoded = Self {
            request_id: reader.bstr("request_id")?,
            action: reader.bstr("action")?,
            params: reader.bstr("params")?,
        };
        reader.finish("invoke body")?;
        Ok(decoded)
    }

    /// Encodes the body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        put_bstr(&mut out, &self.request_id)?;
        put_bstr(&mut out, &self.action)?;
        put_bstr(&mut out, &self.params)?;
        Ok(out)
    }
}

/// Body of a `result` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultBody {
    /// Correlation id echoed from the invoke.
    pub request_id: Vec<u8>,
    /// Opaque result bytes.
    pub result: Vec<u8>,
}

impl ResultBody {
    /// Decodes a result body.
    pub fn decode(body: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(body);
        let decoded = Self {
            request_id: reader.bstr("request_id")?,
            result: reader.bstr("result")?,
        };
        reader.finish("result body")?;
        Ok(decoded)
    }

    /// Encodes the body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        put_bstr(&mut out, &self.request_id)?;
        put_bstr(&mut out, &self.result)?;
        Ok(out)
    }
}

/// Body of an `error` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    /// Correlation id, empty when no request is attributable.
    pub request_id: Vec<u8>,
    /// Failure classification.
    pub code: ErrorCode,
    /// Human-readable diagnostic.
    pub message: Vec<u8>,
}

impl ErrorBody {
    /// Decodes an error body.
    pub fn decode(body: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(body);
        let request_id = reader.bstr("request_id")?;
        let code = ErrorCode::from_wire(reader.u16_le("code")?)?;
        let message = reader.bstr("message")?;
        reader.finish("error body")?;
        Ok(Self {
            request_id,
            code,
            message,
        })
    }

    /// Encodes the body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        put_bstr(&mut out, &self.request_id)?;
        out.put_u16_le(self.code.as_wire());
        put_bstr(&mut out, &self.message)?;
        Ok(out)
    }
}
