//! Streaming frame codec.
//!
//! [`FrameCodec`] implements [`tokio_util::codec`]'s `Decoder` and `Encoder`
//! so a transport can be driven through `Framed`. Decoding is staged
//! (header, then payload) and survives arbitrary TCP segmentation: a header
//! split across reads, a payload split across reads, or several frames
//! coalesced into one read all produce the same frame sequence. `Ok(None)`
//! from `decode` means "need more bytes"; the partial input stays buffered.
//!
//! Server-side rules enforced here:
//! - client frames must be masked; an unmasked frame is a protocol error
//! - 64-bit payload lengths must have their top 32 bits zero
//! - control frames must be final and carry at most 125 payload bytes
//! - a single frame above the configured payload limit is rejected before
//!   its payload is buffered

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE};
use crate::Error;

/// Decoding state for a frame whose header has not fully arrived.
struct Header {
    /// Indicates if this is the final fragment in a message.
    fin: bool,
    /// The operation code of the frame.
    opcode: OpCode,
    /// Encoded 7-bit length of the payload.
    length_code: u8,
    /// Bytes of extended length still to read (0, 2 or 8).
    extra: usize,
    /// Remaining header size in bytes: extended length plus masking key.
    header_size: usize,
}

/// Decoding state for a frame whose payload has not fully arrived.
struct HeaderAndMask {
    header: Header,
    mask: [u8; 4],
    payload_len: usize,
}

enum ReadState {
    Header(Header),
    Payload(HeaderAndMask),
}

/// Frame decoder and encoder for server-side connections.
pub struct FrameCodec {
    state: Option<ReadState>,
    /// Maximum accepted payload length for a single frame; 0 disables.
    max_payload: usize,
    /// Fail frames with any RSV bit set.
    reject_reserved_bits: bool,
}

impl FrameCodec {
    pub fn new(max_payload: usize, reject_reserved_bits: bool) -> Self {
        Self {
            state: None,
            max_payload,
            reject_reserved_bits,
        }
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;

                    if self.reject_reserved_bits && src[0] & 0b0111_0000 != 0 {
                        return Err(Error::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    // Clients MUST mask every frame they send.
                    if !masked {
                        return Err(Error::UnmaskedFrame);
                    }

                    if opcode.is_control() && !fin {
                        return Err(Error::ControlFrameFragmented);
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        opcode,
                        length_code,
                        extra,
                        header_size: extra + 4,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => {
                            // Payloads beyond 2^32 - 1 are unsupported; the
                            // top half of the 64-bit length must be zero.
                            if src.get_u32() != 0 {
                                return Err(Error::PayloadLengthOverflow);
                            }
                            src.get_u32() as usize
                        }
                        _ => unreachable!(),
                    };

                    let mask = src.get_u32().to_be_bytes();

                    if header.opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
                        return Err(Error::ControlFrameTooLarge);
                    }
                    if self.max_payload > 0 && payload_len > self.max_payload {
                        return Err(Error::MessageTooBig);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(state)) => {
                    if src.remaining() < state.payload_len {
                        self.state = Some(ReadState::Payload(state));
                        return Ok(None);
                    }

                    let payload = src.split_to(state.payload_len);
                    let mut frame = Frame::new(
                        state.header.fin,
                        state.header.opcode,
                        Some(state.mask),
                        payload,
                    );
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = Error;

    /// Serializes a frame: header, optional masking key, payload.
    ///
    /// Frames built by the server constructors carry no mask, producing the
    /// FIN=1 MASK=0 frames the protocol requires of servers.
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
