//! Application frame layout.
//!
//! ```text
//! offset 0:   magic (1 byte) = 0x42 ('B')
//! offset 1:   version (1 byte) = 0x01
//! offset 2:   remainder_length (u32 BE) -- bytes following this field
//! offset 6:   command (u32 BE)
//! offset 10:  request_id (16-byte UUID)
//! offset 26:  node_id    (16-byte UUID)
//! offset 42:  user_id    (16-byte UUID)
//! offset 58:  payload    (remainder_length - 52 bytes)
//! ```
//!
//! One datagram carries exactly one frame; the decoder rejects trailing bytes.

use box_core::{NodeId, UserId};
use uuid::Uuid;

use crate::{CodecError, Result};

pub const MAGIC: u8 = 0x42;
pub const VERSION: u8 = 0x01;

/// Bytes of a frame before the payload begins.
pub const FRAME_FIXED_LEN: usize = 58;

/// Fixed fields counted inside `remainder_length` (command + three UUIDs).
const REMAINDER_FIXED: usize = 52;

/// Largest payload a single 1200-byte datagram can carry.
pub const MAX_PAYLOAD: usize = 1200 - FRAME_FIXED_LEN;

/// Command table. Ids are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Hello = 1,
    Put = 2,
    Get = 3,
    Delete = 4,
    Status = 5,
    /// Reserved; decoded but never dispatched.
    Search = 6,
    Bye = 7,
    Locate = 8,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Command::Hello,
            2 => Command::Put,
            3 => Command::Get,
            4 => Command::Delete,
            5 => Command::Status,
            6 => Command::Search,
            7 => Command::Bye,
            8 => Command::Locate,
            _ => return None,
        })
    }
}

/// A single request or response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub request_id: Uuid,
    pub node_id: NodeId,
    pub user_id: UserId,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Frame with zeroed node/user ids, as HELLO uses before identities are
    /// exchanged.
    pub fn anonymous(command: Command, request_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            command,
            request_id,
            node_id: NodeId::NIL,
            user_id: UserId::NIL,
            payload,
        }
    }

    /// Serialize into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let remainder = REMAINDER_FIXED + self.payload.len();
        let mut out = Vec::with_capacity(6 + remainder);
        out.push(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&(remainder as u32).to_be_bytes());
        out.extend_from_slice(&(self.command as u32).to_be_bytes());
        out.extend_from_slice(self.request_id.as_bytes());
        out.extend_from_slice(self.node_id.as_bytes());
        out.extend_from_slice(self.user_id.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one frame from a whole datagram.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 || buf[0] != MAGIC {
            return Err(CodecError::MalformedHeader);
        }
        if buf[1] != VERSION {
            return Err(CodecError::UnsupportedVersion);
        }
        let remainder = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        if remainder < REMAINDER_FIXED {
            return Err(CodecError::InvalidLength);
        }
        if buf.len() < 6 + remainder {
            return Err(CodecError::TruncatedPayload);
        }
        if buf.len() > 6 + remainder {
            // One frame per datagram; trailing bytes mean a framing bug.
            return Err(CodecError::InvalidLength);
        }
        let command_id = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let command =
            Command::from_u32(command_id).ok_or(CodecError::UnsupportedCommand(command_id))?;
        let request_id = Uuid::from_bytes(uuid_field(buf, 10));
        let node_id = NodeId::from_bytes(uuid_field(buf, 26));
        let user_id = UserId::from_bytes(uuid_field(buf, 42));
        Ok(Self {
            command,
            request_id,
            node_id,
            user_id,
            payload: buf[FRAME_FIXED_LEN..].to_vec(),
        })
    }
}

fn uuid_field(buf: &[u8], offset: usize) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[offset..offset + 16]);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frame(command: Command, payload: Vec<u8>) -> Frame {
        Frame {
            command,
            request_id: Uuid::new_v4(),
            node_id: NodeId(Uuid::new_v4()),
            user_id: UserId(Uuid::new_v4()),
            payload,
        }
    }

    #[test]
    fn roundtrip_all_commands() {
        for command in [
            Command::Hello,
            Command::Put,
            Command::Get,
            Command::Delete,
            Command::Status,
            Command::Search,
            Command::Bye,
            Command::Locate,
        ] {
            let frame = sample_frame(command, b"payload".to_vec());
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn fixed_offsets() {
        let frame = sample_frame(Command::Put, vec![0xAA, 0xBB]);
        let bytes = frame.encode();
        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(&bytes[2..6], &(54u32.to_be_bytes()));
        assert_eq!(&bytes[6..10], &(2u32.to_be_bytes()));
        assert_eq!(&bytes[10..26], frame.request_id.as_bytes());
        assert_eq!(&bytes[26..42], frame.node_id.as_bytes());
        assert_eq!(&bytes[42..58], frame.user_id.as_bytes());
        assert_eq!(&bytes[58..], &[0xAA, 0xBB]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_frame(Command::Get, Vec::new()).encode();
        bytes[0] = 0x43;
        assert_eq!(Frame::decode(&bytes), Err(CodecError::MalformedHeader));
    }

    #[test]
    fn rejects_short_buffer() {
        assert_eq!(Frame::decode(&[0x42, 0x01, 0x00]), Err(CodecError::MalformedHeader));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = sample_frame(Command::Get, Vec::new()).encode();
        bytes[1] = 0x02;
        assert_eq!(Frame::decode(&bytes), Err(CodecError::UnsupportedVersion));
    }

    #[test]
    fn rejects_undersized_remainder() {
        let mut bytes = sample_frame(Command::Get, Vec::new()).encode();
        bytes[2..6].copy_from_slice(&51u32.to_be_bytes());
        bytes.truncate(6 + 51);
        assert_eq!(Frame::decode(&bytes), Err(CodecError::InvalidLength));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut bytes = sample_frame(Command::Put, vec![1, 2, 3]).encode();
        // Declare more payload than the buffer holds.
        bytes[2..6].copy_from_slice(&(52u32 + 1000).to_be_bytes());
        assert_eq!(Frame::decode(&bytes), Err(CodecError::TruncatedPayload));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = sample_frame(Command::Get, Vec::new()).encode();
        bytes.push(0);
        assert_eq!(Frame::decode(&bytes), Err(CodecError::InvalidLength));
    }

    #[test]
    fn rejects_unknown_command() {
        let mut bytes = sample_frame(Command::Get, Vec::new()).encode();
        bytes[6..10].copy_from_slice(&99u32.to_be_bytes());
        assert_eq!(Frame::decode(&bytes), Err(CodecError::UnsupportedCommand(99)));
    }

    proptest! {
        #[test]
        fn roundtrip_random_payload(payload in proptest::collection::vec(any::<u8>(), 0..MAX_PAYLOAD)) {
            let frame = sample_frame(Command::Put, payload);
            prop_assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }
}
