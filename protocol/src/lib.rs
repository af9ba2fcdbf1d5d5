use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

// Every frame occupies exactly one fixed-size block on the wire:
//
//   0       1               4                              32            1024
//   +-------+---------------+------------------------------+-------------+
//   | kind  | length (24b)  | reserved (zero)              | payload ... |
//   +-------+---------------+------------------------------+-------------+
//
// kind and length share one little-endian u32, kind in the low byte.
// The payload region is zero padded past length.

pub const FRAME_SIZE: usize = 1024;
pub const HEADER_SIZE: usize = 32;
pub const PAYLOAD_CAPACITY: usize = FRAME_SIZE - HEADER_SIZE;
pub const NAME_CAPACITY: usize = 32;

pub const SERVER_PORT: u16 = 9090;
pub const SERVER_ADDR: &str = "127.0.0.1:9090";

const KIND_PLAIN: u8 = 0;
const KIND_REGISTER: u8 = 1;
const KIND_OFFLINE: u8 = 2;
const KIND_ONLINE: u8 = 3;

const KIND_MASK: u32 = 0xff;
const LENGTH_SHIFT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Plain, // 0, chat text
    Register, // 1, payload is the requested display name
    Offline, // 2
    Online, // 3
}

impl Kind {
    pub fn tag(self) -> u8 {
        match self {
            Kind::Plain => KIND_PLAIN,
            Kind::Register => KIND_REGISTER,
            Kind::Offline => KIND_OFFLINE,
            Kind::Online => KIND_ONLINE,
        }
    }
}

impl TryFrom<u8> for Kind {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            KIND_PLAIN => Ok(Kind::Plain),
            KIND_REGISTER => Ok(Kind::Register),
            KIND_OFFLINE => Ok(Kind::Offline),
            KIND_ONLINE => Ok(Kind::Online),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Plain => "plain",
            Kind::Register => "register",
            Kind::Offline => "offline",
            Kind::Online => "online",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("declared payload length {0} exceeds payload capacity")]
    Oversized(usize),
}

/// One decoded protocol unit. The payload never exceeds `PAYLOAD_CAPACITY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: Kind,
    payload: Bytes,
}

impl Frame {
    /// Builds a frame, truncating the payload to the block's capacity.
    pub fn new(kind: Kind, payload: impl AsRef<[u8]>) -> Self {
        let bytes = payload.as_ref();
        let end = bytes.len().min(PAYLOAD_CAPACITY);

        Frame {
            kind,
            payload: Bytes::copy_from_slice(&bytes[..end]),
        }
    }

    // text payloads are cut on a char boundary so receivers always see valid utf8
    pub fn plain(text: &str) -> Self {
        Frame::new(Kind::Plain, truncate_utf8(text, PAYLOAD_CAPACITY))
    }

    pub fn register(name: &str) -> Self {
        Frame::new(Kind::Register, truncate_utf8(name, NAME_CAPACITY))
    }

    pub fn online() -> Self {
        Frame::new(Kind::Online, b"")
    }

    pub fn offline() -> Self {
        Frame::new(Kind::Offline, b"")
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encodes into a single wire block, e.g. for fanning the same bytes out
    /// to many sockets.
    pub fn to_block(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(FRAME_SIZE);
        encode_block(self, &mut dst);
        dst.freeze()
    }
}

/// Fixed-block codec shared by the reactor (called directly on a read buffer)
/// and the client (through `FramedRead` / `FramedWrite`).
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_SIZE {
            src.reserve(FRAME_SIZE - src.len());
            return Ok(None)
        }

        // the block is consumed even when it turns out to be malformed,
        // so the stream stays aligned on block boundaries
        let mut block = src.split_to(FRAME_SIZE);
        decode_block(&mut block).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_block(&item, dst);
        Ok(())
    }
}

// read one full block into a Frame
fn decode_block(block: &mut BytesMut) -> Result<Frame, FrameError> {
    let header = block.get_u32_le();
    let tag = (header & KIND_MASK) as u8;
    let length = (header >> LENGTH_SHIFT) as usize;

    if length > PAYLOAD_CAPACITY {
        debug!("rejecting block, declared length {}", length);
        return Err(FrameError::Oversized(length))
    }

    let kind = Kind::try_from(tag)?;
    block.advance(HEADER_SIZE - 4);

    Ok(Frame {
        kind,
        payload: block.split_to(length).freeze(),
    })
}

// write a Frame as one zero padded block
fn encode_block(frame: &Frame, dst: &mut BytesMut) {
    let length = frame.payload.len();
    let header = u32::from(frame.kind.tag()) | ((length as u32) << LENGTH_SHIFT);

    dst.reserve(FRAME_SIZE);
    dst.put_u32_le(header);
    dst.put_bytes(0, HEADER_SIZE - 4);
    dst.extend_from_slice(&frame.payload);
    dst.put_bytes(0, PAYLOAD_CAPACITY - length);
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s
    }

    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
