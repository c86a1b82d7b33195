//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the atomic unit of the wire protocol: a small header carrying
//! the FIN flag, a 4-bit opcode and the payload length, an optional 4-byte
//! masking key, and the payload itself.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! ```
//!
//! The server always emits final (FIN=1), unmasked frames; clients must mask
//! every frame they send. Frames built by the facade use the constructors
//! ([`Frame::text`], [`Frame::binary`], [`Frame::ping`], ...); the masked
//! constructor [`Frame::new`] exists for decoding and for exercising the
//! client side of the protocol in tests.

use bytes::{Bytes, BytesMut};

use crate::close::CloseReason;
use crate::Error;

/// Maximum payload length of a control frame (close, ping, pong).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible frame header: 2 bytes fixed + 8 bytes extended length +
/// 4 bytes masking key, rounded up.
pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// WebSocket operation code, the 4-bit type tag of a frame.
///
/// Reserved opcodes (0x3-0x7 data, 0xB-0xF control) are rejected during
/// decoding per RFC 6455, so they have no variant here.
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
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and their payload must not
    /// exceed [`MAX_CONTROL_PAYLOAD`] bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(Error::InvalidOpCode(value)),
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

/// A single WebSocket frame.
///
/// # Fields
/// - `fin`: final-fragment flag. `false` only on the leading frames of a
///   fragmented message.
/// - `opcode`: frame type.
/// - `mask`: masking key, present on frames decoded from a client before
///   unmasking, or set explicitly to emit a client-style frame in tests.
/// - `payload`: payload bytes.
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key for the frame, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a frame with explicit protocol fields.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// A final unmasked text frame.
    pub fn text(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// A final unmasked binary frame.
    pub fn binary(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// A ping frame carrying `payload` as the token the peer must echo.
    pub fn ping(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// A pong frame echoing a ping payload.
    pub fn pong(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// A close frame carrying a status code and message.
    pub fn close(reason: CloseReason) -> Self {
        Self::new(true, OpCode::Close, None, &*reason.to_payload())
    }

    /// Returns whether the frame carries a masking key.
    #[cfg(test)]
    pub(crate) fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Masks the payload, generating a random key when none is set.
    ///
    /// Only used to produce client-style frames in tests; server frames go
    /// out unmasked.
    #[cfg(test)]
    pub(crate) fn mask(&mut self) {
        let mask = self.mask.unwrap_or_else(rand::random);
        crate::mask::apply_mask(&mut self.payload, mask);
        self.mask = Some(mask);
    }

    /// Removes the mask from the payload using the frame's key.
    pub(crate) fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, mask);
        }
    }

    /// Freezes the payload into immutable bytes.
    pub fn into_payload(self) -> Bytes {
        self.payload.freeze()
    }

    /// Formats the frame header into `head` and returns the header size.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let mut at = LengthCode::for_payload(self.payload.len()).write(head);

        if let Some(key) = self.mask {
            head[1] |= 0x80;
            head[at..at + 4].copy_from_slice(&key);
            at += 4;
        }

        at
    }
}

/// Wire encoding chosen for a payload length (RFC 6455 §5.2): the 7-bit
/// field directly, or the escape values 126/127 followed by a 16- or
/// 64-bit big-endian length.
///
/// Payloads above 2^32 - 1 bytes are not supported, so the top 32 bits of
/// a 64-bit length are always written as zero.
enum LengthCode {
    Direct(u8),
    Extended16(u16),
    Extended64(u64),
}

impl LengthCode {
    fn for_payload(len: usize) -> Self {
        if len <= 125 {
            LengthCode::Direct(len as u8)
        } else if len <= 65535 {
            LengthCode::Extended16(len as u16)
        } else {
            LengthCode::Extended64(len as u64)
        }
    }

    /// Writes the length field starting at `head[1]` and returns the
    /// offset of the first byte after it.
    fn write(self, head: &mut [u8]) -> usize {
        match self {
            LengthCode::Direct(len) => {
                head[1] = len;
                2
            }
            LengthCode::Extended16(len) => {
                head[1] = 126;
                head[2..4].copy_from_slice(&len.to_be_bytes());
                4
            }
            LengthCode::Extended64(len) => {
                head[1] = 127;
                head[2..10].copy_from_slice(&len.to_be_bytes());
                10
            }
        }
    }
}
