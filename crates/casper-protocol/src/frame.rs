//! Frame layout and limits.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Default per-connection read buffer capacity (64 KiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Largest payload a buffer of `capacity` bytes can hold alongside its header.
pub const fn max_payload(capacity: usize) -> usize {
    capacity.saturating_sub(HEADER_LEN)
}

/// Errors raised while framing or unframing messages.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Declared payload length exceeds what the receiver can buffer
    #[error("Frame too large: {len} bytes (max: {max})")]
    Oversized { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads the declared payload length from the front of `buf`.
///
/// Returns `None` until a complete header is available.
pub fn peek_length(buf: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_LEN] = buf.get(..HEADER_LEN)?.try_into().ok()?;
    usize::try_from(u32::from_be_bytes(header)).ok()
}

/// Encodes `payload` as a single frame.
///
/// Fails with [`FrameError::Oversized`] if the payload is larger than
/// `max` or cannot be described by a 32-bit length.
pub fn encode_frame(payload: &[u8], max: usize) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_frame(payload, max, &mut dst)?;
    Ok(dst.freeze())
}

pub(crate) fn put_frame(payload: &[u8], max: usize, dst: &mut BytesMut) -> Result<(), FrameError> {
    let oversized = || FrameError::Oversized {
        len: payload.len(),
        max,
    };
    if payload.len() > max {
        return Err(oversized());
    }
    let len = u32::try_from(payload.len()).map_err(|_| oversized())?;

    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32(len);
    dst.extend_from_slice(payload);
    Ok(())
}
