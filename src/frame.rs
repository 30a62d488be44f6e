//! WebSocket frames ([RFC 6455 section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2)).
//!
//! A frame on the wire is a 2 to 14 byte header followed by the payload:
//!
//! ```text
//! byte 0    FIN | RSV1 | RSV2 | RSV3 | opcode (4 bits)
//! byte 1    MASK | payload length (7 bits)
//! +2 or +8  extended length when the 7-bit length is 126 or 127 (network order)
//! +4        masking key when MASK is set
//! ```
//!
//! `Continuation`, `Text` and `Binary` carry message data. `Close`, `Ping` and
//! `Pong` are control frames: never fragmented, 125 payload bytes at most.
//!
//! A [`Frame`] always holds its payload in clear text. The masking key, when present, is
//! applied by the encoder on the way out and removed by the decoder on the way in.
//!
//! ```rust
//! use wsengine::{close::CloseCode, frame::Frame};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let ping = Frame::ping("ping payload");
//! let close = Frame::close(CloseCode::Normal, b"Normal closure");
//! assert!(close.opcode.is_control());
//! ```
use bytes::BytesMut;

use crate::{close::CloseCode, WebSocketError};

/// Frame opcode. Values 0x3-0x7 and 0xB-0xF are reserved and fail to parse.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// `Close`, `Ping` and `Pong`. These may arrive between the fragments of a message.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Continuation`, `Text` and `Binary`.
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// The three reserved header bits. `rsv1` marks a compressed message when a
/// per-message compression extension is active.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Rsv {
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
}

impl Rsv {
    /// Only `rsv1` set.
    pub const COMPRESSED: Rsv = Rsv {
        rsv1: true,
        rsv2: false,
        rsv3: false,
    };

    /// Builds the bits from the 3-bit value found in the header (`rsv1` is the high bit).
    pub fn from_bits(bits: u8) -> Self {
        Self {
            rsv1: bits & 0b100 != 0,
            rsv2: bits & 0b010 != 0,
            rsv3: bits & 0b001 != 0,
        }
    }

    /// The 3-bit value as it appears in the header.
    pub fn bits(&self) -> u8 {
        (self.rsv1 as u8) << 2 | (self.rsv2 as u8) << 1 | self.rsv3 as u8
    }

    /// Returns `true` if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }
}

/// Everything that precedes a frame's payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bits.
    pub rsv: Rsv,
    /// Frame type.
    pub opcode: OpCode,
    /// Masking key, present on client-to-server frames.
    pub mask: Option<[u8; 4]>,
    /// Length of the payload that follows the header.
    pub payload_len: u64,
}

impl FrameHeader {
    /// Returns `true` if the rsv1 bit marks the message as compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.rsv.rsv1
    }

    /// Number of bytes this header occupies when serialized.
    pub fn encoded_len(&self) -> usize {
        let len = match self.payload_len {
            0..=125 => 2,
            126..=65535 => 4,
            _ => 10,
        };
        len + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Formats the header into the provided `head` buffer and returns its size.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | self.rsv.bits() << 4 | u8::from(self.opcode);

        let len = self.payload_len;
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&len.to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// Maximum payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// A complete frame: header fields plus the clear-text payload.
///
/// [`Connection`](crate::Connection) builds these from its `send_*` calls. Building
/// them by hand is for the standalone [`codec`](crate::codec) and for scripting raw
/// exchanges in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv: Rsv,
    pub opcode: OpCode,
    /// Applied by the encoder; the in-memory payload is never masked.
    pub mask: Option<[u8; 4]>,
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new frame with no reserved bits set.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            rsv: Rsv::default(),
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a new frame whose payload was compressed by a per-message extension.
    pub fn compress(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            rsv: Rsv::COMPRESSED,
            ..Self::new(fin, opcode, mask, payload)
        }
    }

    /// A final, unmasked text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, BytesMut::from(payload.as_ref()))
    }

    /// A final, unmasked binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, BytesMut::from(payload.as_ref()))
    }

    /// A ping frame.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, BytesMut::from(payload.as_ref()))
    }

    /// A close frame carrying a status code and reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Sets the masking key used when the frame is encoded.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Returns `true` if the rsv1 bit marks the payload as compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.rsv.rsv1
    }

    /// Returns whether the frame carries a masking key.
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// The status code of a close frame, if its payload carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// The reason of a close frame, if present and valid UTF-8.
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// The header describing this frame.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            fin: self.fin,
            rsv: self.rsv,
            opcode: self.opcode,
            mask: self.mask,
            payload_len: self.payload.len() as u64,
        }
    }
}
