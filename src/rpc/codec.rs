//! NRPC frame codec.
//!
//! ```text
//! 0      4        5     6      7            11          15
//! +------+--------+-----+------+------------+-----------+--------+
//! | magic| version| kind| flags| request_id | body_len  | body   |
//! | 4 B  | u8     | u8  | u8   | u32 BE     | u32 BE    | ...    |
//! +------+--------+-----+------+------------+-----------+--------+
//! ```
//!
//! The magic is configurable per deployment; both peers must agree on it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_MAGIC: [u8; 4] = *b"NRPC";
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 15;

/// Request flag: the caller does not wait for a response.
pub const FLAG_NO_ACK: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Request = 1,
    Response = 2,
    Ping = 3,
    Pong = 4,
}

impl PacketKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketKind::Request),
            2 => Some(PacketKind::Response),
            3 => Some(PacketKind::Ping),
            4 => Some(PacketKind::Pong),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcPacket {
    pub kind: PacketKind,
    pub flags: u8,
    pub request_id: u32,
    pub body: Bytes,
}

impl RpcPacket {
    pub fn request(request_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::Request,
            flags: 0,
            request_id,
            body: body.into(),
        }
    }

    pub fn response(request_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::Response,
            flags: 0,
            request_id,
            body: body.into(),
        }
    }

    /// Heartbeats are never correlated; their request id is always zero.
    pub fn ping() -> Self {
        Self {
            kind: PacketKind::Ping,
            flags: 0,
            request_id: 0,
            body: Bytes::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: PacketKind::Pong,
            ..Self::ping()
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn expects_response(&self) -> bool {
        self.kind == PacketKind::Request && self.flags & FLAG_NO_ACK == 0
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic {found:02x?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown packet kind {0}")]
    UnknownKind(u8),

    #[error("frame body of {len} bytes exceeds the limit of {max}")]
    TooLong { len: usize, max: usize },
}

/// Parse a configured magic string; it must be exactly four bytes.
pub fn parse_magic(value: &str) -> Option<[u8; 4]> {
    value.as_bytes().try_into().ok()
}

/// `tokio_util` codec for [`RpcPacket`] frames.
#[derive(Debug, Clone)]
pub struct RpcCodec {
    magic: [u8; 4],
    max_body_len: usize,
}

impl RpcCodec {
    pub fn new(magic: [u8; 4], max_body_len: usize) -> Self {
        Self { magic, max_body_len }
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAGIC, 10 * 1024 * 1024)
    }
}

impl Decoder for RpcCodec {
    type Item = RpcPacket;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RpcPacket>, CodecError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut found = [0u8; 4];
        found.copy_from_slice(&src[..4]);
        if found != self.magic {
            return Err(CodecError::BadMagic { found });
        }
        let version = src[4];
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let kind = PacketKind::from_u8(src[5]).ok_or(CodecError::UnknownKind(src[5]))?;
        let flags = src[6];
        let request_id = u32::from_be_bytes([src[7], src[8], src[9], src[10]]);
        let len = u32::from_be_bytes([src[11], src[12], src[13], src[14]]) as usize;
        if len > self.max_body_len {
            return Err(CodecError::TooLong {
                len,
                max: self.max_body_len,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        Ok(Some(RpcPacket {
            kind,
            flags,
            request_id,
            body,
        }))
    }
}

impl Encoder<RpcPacket> for RpcCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: RpcPacket, dst: &mut BytesMut) -> Result<(), CodecError> {
        if packet.body.len() > self.max_body_len {
            return Err(CodecError::TooLong {
                len: packet.body.len(),
                max: self.max_body_len,
            });
        }
        dst.reserve(HEADER_LEN + packet.body.len());
        dst.put_slice(&self.magic);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(packet.kind as u8);
        dst.put_u8(packet.flags);
        dst.put_u32(packet.request_id);
        dst.put_u32(packet.body.len() as u32);
        dst.put_slice(&packet.body);
        Ok(())
    }
}
