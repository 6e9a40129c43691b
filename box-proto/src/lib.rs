#![forbid(unsafe_code)]

//! Box wire protocol codec.
//!
//! These types ARE the protocol: every field, size and byte order here is
//! part of the wire format. The codec is pure — no I/O, no allocation beyond
//! the output buffer — and round-trips every well-formed frame:
//! `decode(encode(f)) = f`.
//!
//! All multi-byte integers are big-endian.

pub mod frame;
pub mod payload;
pub mod status;

pub use frame::{Command, Frame, FRAME_FIXED_LEN, MAX_PAYLOAD};
pub use payload::{HelloPayload, LocatePayload, PutPayload, QueuePayload, StatusPayload};
pub use status::Status;

use thiserror::Error;

pub type Result<T, E = CodecError> = core::result::Result<T, E>;

/// Decoder rejection taxonomy. Encoding never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Buffer too short for the fixed header, or wrong magic byte.
    #[error("malformed header")]
    MalformedHeader,
    /// Version byte other than the one supported revision.
    #[error("unsupported version")]
    UnsupportedVersion,
    /// Command id outside the assigned table.
    #[error("unsupported command {0}")]
    UnsupportedCommand(u32),
    /// Declared length runs past the end of the buffer.
    #[error("truncated payload")]
    TruncatedPayload,
    /// Declared length cannot hold the fixed fields, or does not match the
    /// datagram exactly.
    #[error("invalid length")]
    InvalidLength,
    /// A text field is not valid UTF-8.
    #[error("invalid utf-8")]
    InvalidUtf8,
}
