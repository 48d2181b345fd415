//! Length-prefixed frame codec for the gate sockets.
//!
//! Each frame consists of:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The codec enforces bounded reads: the frame length is validated against
//! [`MAX_FRAME_SIZE`] before any allocation, so a hostile peer cannot force
//! memory exhaustion with a large length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};

/// Length of the frame header (4 bytes for a u32 length prefix).
const HEADER_LEN: usize = 4;

/// Frame codec implementing length-prefixed binary framing.
///
/// Used with [`tokio_util::codec::Framed`] to provide frame-based I/O over
/// the agent and repeater sockets. Frames are at most [`MAX_FRAME_SIZE`]
/// bytes; empty frames are valid at this layer (the envelope decoder above
/// rejects them).
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a frame codec with the protocol's maximum frame size.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Returns the maximum frame size for this codec.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Bytes>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before allocating or reserving anything.
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> ProtocolResult<()> {
        Encoder::<&[u8]>::encode(self, &item, dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> ProtocolResult<()> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // validated above
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(item);
        Ok(())
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> ProtocolResult<()> {
        Encoder::<&[u8]>::encode(self, &item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"hello world");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_LEN + payload.len());
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_header_waits() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn decode_partial_payload_waits() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 2, 3, 4, 5][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut codec = FrameCodec::new();
        let oversized = (MAX_FRAME_SIZE + 1) as u32;
        let mut buf = BytesMut::new();
        buf.put_u32(oversized);
        buf.extend_from_slice(&[0u8; 16]);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size, max })
            if size == oversized as usize && max == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn encode_rejects_oversized_frame() {
        let mut codec = FrameCodec::new();
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];

        let mut buf = BytesMut::new();
        let result = codec.encode(payload.as_slice(), &mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size, .. }) if size == MAX_FRAME_SIZE + 1
        ));
    }

    #[test]
    fn decode_multiple_frames() {
        let mut codec = FrameCodec::new();
        let first = Bytes::from_static(b"first");
        let second = Bytes::from_static(b"second");

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }

    #[test]
    fn max_size_frame_roundtrips() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from(vec![0xABu8; MAX_FRAME_SIZE]);

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), MAX_FRAME_SIZE);
    }
}
