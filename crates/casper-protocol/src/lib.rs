//! casper protocol - wire framing for the relay daemon
//!
//! Every message on the wire is a frame: a 4-byte big-endian unsigned
//! length `L` followed by `L` payload bytes. This crate provides the frame
//! constants, a one-shot encoder for clients, and a `tokio_util` codec used
//! by the daemon to reassemble frames from partial reads.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{
    encode_frame, max_payload, peek_length, FrameError, DEFAULT_BUFFER_CAPACITY, HEADER_LEN,
};
