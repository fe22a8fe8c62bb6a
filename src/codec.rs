//! Frame codec for use with [`tokio_util::codec::FramedRead`] and
//! [`tokio_util::codec::FramedWrite`].
//!
//! [`Decoder`] parses inbound bytes into validated [`Frame`]s, retaining
//! parsed header state across partial reads so a frame split over multiple
//! socket reads resumes without reparsing. [`Encoder`] serializes outbound
//! frames, applying the connection's client masking key.

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    WsError,
    frame::{Frame, MAX_HEAD_SIZE, OpCode},
    mask::apply_mask,
    options::MAX_PAYLOAD_READ,
};

/// Header fields parsed from a frame whose payload has not fully arrived.
struct ReadState {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Decodes inbound WebSocket frames.
///
/// Performs the protocol checks that apply at the frame level: reserved
/// bits, opcode validity, control frame constraints and the payload size
/// ceiling. Masked payloads are unmasked before the frame is yielded.
pub struct Decoder {
    state: Option<ReadState>,
    max_payload_read: usize,
}

impl Decoder {
    pub fn new(max_payload_read: usize) -> Self {
        Self {
            state: None,
            max_payload_read,
        }
    }

    /// Parses a frame header out of `src`, or returns `None` when the
    /// buffer does not yet hold a complete header.
    fn parse_head(&mut self, src: &mut BytesMut) -> Result<Option<ReadState>, WsError> {
        if src.remaining() < 2 {
            return Ok(None);
        }

        // A non-zero RSV bit without a negotiated extension is fatal.
        if src[0] & 0x70 != 0 {
            return Err(WsError::ReservedBitsNotZero);
        }

        let fin = src[0] & 0x80 != 0;
        let opcode = OpCode::try_from(src[0] & 0x0F)?;
        let masked = src[1] & 0x80 != 0;
        let length_code = src[1] & 0x7F;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + if masked { 4 } else { 0 };
        if src.remaining() < header_size {
            return Ok(None);
        }

        let payload_len: usize = match extra {
            2 => u16::from_be_bytes([src[2], src[3]]) as usize,
            8 => {
                let len = u64::from_be_bytes(src[2..10].try_into().unwrap());
                usize::try_from(len).map_err(|_| WsError::FrameTooLarge {
                    size: u64::MAX as usize,
                    max_size: self.max_payload_read,
                })?
            }
            _ => length_code as usize,
        };

        if opcode.is_control() {
            if !fin {
                return Err(WsError::ControlFrameFragmented);
            }
            if payload_len > 125 {
                return Err(WsError::PingFrameTooLarge);
            }
        }

        if payload_len >= self.max_payload_read {
            return Err(WsError::FrameTooLarge {
                size: payload_len,
                max_size: self.max_payload_read,
            });
        }

        let mask = if masked {
            let offset = 2 + extra;
            Some([
                src[offset],
                src[offset + 1],
                src[offset + 2],
                src[offset + 3],
            ])
        } else {
            None
        };

        src.advance(header_size);
        Ok(Some(ReadState {
            fin,
            opcode,
            mask,
            payload_len,
        }))
    }
}

impl tokio_util::codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WsError> {
        let state = match self.state.take() {
            Some(state) => state,
            None => match self.parse_head(src)? {
                Some(state) => state,
                None => return Ok(None),
            },
        };

        if src.remaining() < state.payload_len {
            // Not enough payload yet; stash the parsed header and grow the
            // buffer so the next read can complete the frame in one pass.
            src.reserve(state.payload_len - src.remaining());
            self.state = Some(state);
            return Ok(None);
        }

        let mut payload = src.split_to(state.payload_len);
        if let Some(mask) = state.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame::new(
            state.fin,
            state.opcode,
            None,
            payload.freeze(),
        )))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_READ)
    }
}

/// Encodes outbound frames, masking payloads with the connection key.
///
/// Frames built through the public constructors carry no mask; the encoder
/// stamps the connection's key on them so every outbound frame is masked as
/// RFC 6455 requires of clients.
pub struct Encoder {
    mask: [u8; 4],
}

impl Encoder {
    pub fn new(mask: [u8; 4]) -> Self {
        Self { mask }
    }
}

impl tokio_util::codec::Encoder<Frame> for Encoder {
    type Error = WsError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), WsError> {
        if frame.mask.is_none() {
            frame.mask = Some(self.mask);
        }

        dst.reserve(MAX_HEAD_SIZE + frame.payload.len());
        frame.write_head(dst);

        let index = dst.len();
        dst.put_slice(&frame.payload);
        if let Some(mask) = frame.mask {
            apply_mask(&mut dst[index..], mask);
        }
        Ok(())
    }
}
