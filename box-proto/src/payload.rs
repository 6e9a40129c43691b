//! Per-command payload layouts. Each codec owns exactly the bytes between
//! the fixed frame header and the end of the datagram.

use uuid::Uuid;

use crate::{CodecError, Result, Status};

/// HELLO: `status:u8, count:u8, versions:u16_BE[count]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPayload {
    pub status: Status,
    pub versions: Vec<u16>,
}

impl HelloPayload {
    /// The single protocol revision spoken today.
    pub const SUPPORTED_VERSION: u16 = 1;

    pub fn supported(status: Status) -> Self {
        Self {
            status,
            versions: vec![Self::SUPPORTED_VERSION],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 2 * self.versions.len());
        out.push(self.status.into());
        out.push(self.versions.len().min(u8::MAX as usize) as u8);
        for v in self.versions.iter().take(u8::MAX as usize) {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(CodecError::TruncatedPayload);
        }
        let status = Status::from_u8(buf[0]).ok_or(CodecError::InvalidLength)?;
        let count = buf[1] as usize;
        if buf.len() < 2 + 2 * count {
            return Err(CodecError::TruncatedPayload);
        }
        if buf.len() > 2 + 2 * count {
            return Err(CodecError::InvalidLength);
        }
        let versions = buf[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { status, versions })
    }
}

/// PUT: `qp_len:u16_BE, qp, ct_len:u16_BE, ct, data_len:u32_BE, data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutPayload {
    pub queue: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl PutPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(8 + self.queue.len() + self.content_type.len() + self.data.len());
        put_str16(&mut out, &self.queue);
        put_str16(&mut out, &self.content_type);
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let queue = cursor.take_str16()?;
        let content_type = cursor.take_str16()?;
        let data_len = cursor.take_u32()? as usize;
        let data = cursor.take_bytes(data_len)?.to_vec();
        cursor.finish()?;
        Ok(Self {
            queue,
            content_type,
            data,
        })
    }
}

/// GET / DELETE: `qp_len:u16_BE, qp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePayload {
    pub queue: String,
}

impl QueuePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.queue.len());
        put_str16(&mut out, &self.queue);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let queue = cursor.take_str16()?;
        cursor.finish()?;
        Ok(Self { queue })
    }
}

/// STATUS: `status:u8, message` — the message consumes the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPayload {
    pub status: Status,
    pub message: String,
}

impl StatusPayload {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.message.len());
        out.push(self.status.into());
        out.extend_from_slice(self.message.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(CodecError::TruncatedPayload);
        }
        let status = Status::from_u8(buf[0]).ok_or(CodecError::InvalidLength)?;
        let message = core::str::from_utf8(&buf[1..])
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_string();
        Ok(Self { status, message })
    }
}

/// LOCATE: `target_uuid:16B` — a node or user id to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatePayload {
    pub target: Uuid,
}

impl LocatePayload {
    pub fn encode(&self) -> Vec<u8> {
        self.target.as_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(CodecError::TruncatedPayload);
        }
        if buf.len() > 16 {
            return Err(CodecError::InvalidLength);
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(buf);
        Ok(Self {
            target: Uuid::from_bytes(bytes),
        })
    }
}

fn put_str16(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len().min(u16::MAX as usize) as u16).to_be_bytes());
    out.extend_from_slice(&s.as_bytes()[..s.len().min(u16::MAX as usize)]);
}

/// Byte cursor shared by the length-prefixed decoders.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(CodecError::InvalidLength)?;
        if end > self.buf.len() {
            return Err(CodecError::TruncatedPayload);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u16(&mut self) -> Result<u16> {
        let b = self.take_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_str16(&mut self) -> Result<String> {
        let len = self.take_u16()? as usize;
        let bytes = self.take_bytes(len)?;
        core::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// Every payload byte must be consumed.
    fn finish(self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(CodecError::InvalidLength)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip() {
        let hello = HelloPayload {
            status: Status::Ok,
            versions: vec![1, 9],
        };
        let bytes = hello.encode();
        assert_eq!(bytes, vec![0, 2, 0, 1, 0, 9]);
        assert_eq!(HelloPayload::decode(&bytes).unwrap(), hello);
    }

    #[test]
    fn hello_empty_version_list_decodes() {
        // count = 0 is well-formed at the codec layer; the broker rejects it.
        let hello = HelloPayload::decode(&[0, 0]).unwrap();
        assert!(hello.versions.is_empty());
    }

    #[test]
    fn hello_rejects_short_and_long() {
        assert_eq!(HelloPayload::decode(&[0]), Err(CodecError::TruncatedPayload));
        assert_eq!(
            HelloPayload::decode(&[0, 2, 0, 1]),
            Err(CodecError::TruncatedPayload)
        );
        assert_eq!(
            HelloPayload::decode(&[0, 1, 0, 1, 0xFF]),
            Err(CodecError::InvalidLength)
        );
    }

    #[test]
    fn put_roundtrip() {
        let put = PutPayload {
            queue: "/INBOX".to_string(),
            content_type: "text/plain".to_string(),
            data: b"alpha".to_vec(),
        };
        assert_eq!(PutPayload::decode(&put.encode()).unwrap(), put);
    }

    #[test]
    fn put_layout_is_byte_exact() {
        let put = PutPayload {
            queue: "/q".to_string(),
            content_type: "t".to_string(),
            data: vec![0xAB],
        };
        let bytes = put.encode();
        assert_eq!(
            bytes,
            vec![0, 2, b'/', b'q', 0, 1, b't', 0, 0, 0, 1, 0xAB]
        );
    }

    #[test]
    fn put_rejects_invalid_utf8() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(PutPayload::decode(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn put_rejects_data_len_past_buffer() {
        let put = PutPayload {
            queue: "/q".to_string(),
            content_type: "t".to_string(),
            data: vec![1, 2, 3],
        };
        let mut bytes = put.encode();
        let data_len_at = bytes.len() - 3 - 4;
        bytes[data_len_at..data_len_at + 4].copy_from_slice(&100u32.to_be_bytes());
        assert_eq!(PutPayload::decode(&bytes), Err(CodecError::TruncatedPayload));
    }

    #[test]
    fn queue_roundtrip_and_trailing_rejection() {
        let get = QueuePayload {
            queue: "/INBOX".to_string(),
        };
        assert_eq!(QueuePayload::decode(&get.encode()).unwrap(), get);

        let mut bytes = get.encode();
        bytes.push(0);
        assert_eq!(QueuePayload::decode(&bytes), Err(CodecError::InvalidLength));
    }

    #[test]
    fn status_message_consumes_rest() {
        let status = StatusPayload::new(Status::NotFound, "not-found");
        let decoded = StatusPayload::decode(&status.encode()).unwrap();
        assert_eq!(decoded, status);

        assert_eq!(StatusPayload::decode(&[]), Err(CodecError::TruncatedPayload));
    }

    #[test]
    fn locate_is_exactly_sixteen_bytes() {
        let locate = LocatePayload {
            target: Uuid::new_v4(),
        };
        assert_eq!(LocatePayload::decode(&locate.encode()).unwrap(), locate);
        assert_eq!(
            LocatePayload::decode(&[0u8; 15]),
            Err(CodecError::TruncatedPayload)
        );
        assert_eq!(
            LocatePayload::decode(&[0u8; 17]),
            Err(CodecError::InvalidLength)
        );
    }
}
