//! `tokio_util` codec for length-prefixed frames.
//!
//! The decoder is incremental: it can be fed one byte at a time and yields
//! a payload only once the header and the full body are buffered. Consumed
//! bytes are removed from the front of the source buffer, leaving any
//! trailing partial frame in place for the next read.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{
    max_payload, peek_length, put_frame, FrameError, DEFAULT_BUFFER_CAPACITY, HEADER_LEN,
};

/// Codec for `[u32 BE length][payload]` frames with a payload ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Creates a codec for a receive buffer of `capacity` bytes.
    ///
    /// The payload ceiling is `capacity - HEADER_LEN`, so a complete frame
    /// always fits in the buffer.
    pub const fn for_capacity(capacity: usize) -> Self {
        Self {
            max_payload: max_payload(capacity),
        }
    }

    /// Returns the largest payload this codec accepts.
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::for_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some(len) = peek_length(src) else {
            return Ok(None);
        };

        if len > self.max_payload {
            return Err(FrameError::Oversized {
                len,
                max: self.max_payload,
            });
        }

        if src.len() < HEADER_LEN + len {
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        put_frame(&item, self.max_payload, dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        put_frame(item, self.max_payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    #[test]
    fn test_decode_waits_for_header() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_waits_for_body() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x05hel"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7, "partial frame must stay buffered");
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut codec = FrameCodec::default();
        let payload = b"split across many reads";
        let wire = encode_frame(payload, codec.max_payload()).unwrap();

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            buf.extend_from_slice(&[*byte]);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0][..], payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_keeps_boundaries() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(&b"one"[..], &mut buf).unwrap();
        codec.encode(&b""[..], &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"three"), &mut buf).unwrap();
        buf.extend_from_slice(b"\x00\x00");

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"three");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"\x00\x00");
    }

    #[test]
    fn test_decode_accepts_exact_ceiling() {
        let mut codec = FrameCodec::for_capacity(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&[7u8; 12], 12).unwrap());
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 12);
    }

    #[test]
    fn test_decode_rejects_oversized_header() {
        let mut codec = FrameCodec::for_capacity(16);
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x0d"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Oversized { len: 13, max: 12 }));
    }

    #[test]
    fn test_encoder_rejects_oversized() {
        let mut codec = FrameCodec::for_capacity(8);
        let mut buf = BytesMut::new();
        assert!(codec.encode(&b"12345"[..], &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
