//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the atomic unit of the wire protocol:
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
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Data frames ([`OpCode::Text`], [`OpCode::Binary`], [`OpCode::Continuation`])
//! carry application payload; control frames ([`OpCode::Close`], [`OpCode::Ping`],
//! [`OpCode::Pong`]) manage the connection and must never be fragmented.

use bytes::Bytes;

use crate::{WsError, close::CloseCode};

/// Frame operation code, identifying how a frame's payload is interpreted.
///
/// The wire values are defined in
/// [RFC 6455 Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8);
/// the ranges 0x3-0x7 and 0xB-0xF are reserved and rejected during decoding.
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
    /// Control frames cannot be fragmented and their payload is capped at
    /// 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WsError::InvalidOpCode(value)),
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

/// One WebSocket frame: fin flag, opcode, optional masking key and payload.
///
/// Outbound frames normally leave `mask` unset; the connection's encoder
/// applies the client mask when the frame hits the wire. Inbound frames are
/// delivered with the payload already unmasked.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment of a message.
    pub(crate) fin: bool,
    /// How the payload is interpreted.
    pub(crate) opcode: OpCode,
    /// Masking key override; `None` defers to the connection mask.
    pub(crate) mask: Option<[u8; 4]>,
    /// Payload bytes.
    pub(crate) payload: Bytes,
}

/// Worst-case frame header size: 2 fixed bytes + 8 length bytes + 4 mask bytes.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

impl Frame {
    /// Creates a final text frame with the given payload.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame with the given payload.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a ping frame with the given payload.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame with the given payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a continuation frame.
    ///
    /// Used for message fragmentation: the first fragment is a Text or
    /// Binary frame with `fin` unset, followed by continuations, the last
    /// of which has `fin` set.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    /// Creates a close frame carrying a status code and UTF-8 reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a close frame with a pre-encoded payload, used to echo the
    /// peer's close payload verbatim.
    pub(crate) fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    pub(crate) fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Sets the fin flag, for building fragmented messages.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Overrides the masking key applied when this frame is encoded.
    #[cfg(test)]
    pub(crate) fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// The frame's opcode.
    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// A reference to the frame's payload.
    #[inline(always)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame, returning its payload.
    #[inline(always)]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Whether this is the final frame of a message.
    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Extracts the close code from a Close frame payload, if one is present.
    pub fn close_code(&self) -> Option<CloseCode> {
        let bytes = self.payload.get(0..2)?.try_into().ok()?;
        Some(CloseCode::from(u16::from_be_bytes(bytes)))
    }

    /// Extracts the UTF-8 close reason from a Close frame payload.
    ///
    /// Returns `Ok(None)` when the payload carries no reason and
    /// `Err(WsError::InvalidUtf8)` when the reason bytes are not UTF-8.
    pub fn close_reason(&self) -> Result<Option<&str>, WsError> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        let reason = self.payload.get(2..).ok_or(WsError::InvalidCloseFrame)?;
        std::str::from_utf8(reason)
            .map(Some)
            .map_err(|_| WsError::InvalidUtf8)
    }

    /// Serializes the frame header (first two bytes, extended length and
    /// masking key) into `dst`.
    pub(crate) fn write_head(&self, dst: &mut bytes::BytesMut) {
        use bytes::BufMut;

        let first_byte = (self.fin as u8) << 7 | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        dst.put_u8(first_byte);
        if len < 126 {
            dst.put_u8(len as u8 | mask_bit);
        } else if len < 65536 {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}
