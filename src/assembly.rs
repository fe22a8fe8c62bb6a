//! Reassembly of fragmented messages.
//!
//! RFC 6455 allows a data message to be split across a Text or Binary frame
//! with the fin flag clear, followed by Continuation frames, the last of
//! which has fin set. Control frames may interleave between fragments but a
//! second data message may not begin before the first completes.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::{
    WsError,
    frame::{Frame, OpCode},
};

/// A complete application message, reassembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
}

impl Message {
    /// Converts the message into a single unfragmented frame.
    pub fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::text(text),
            Message::Binary(bytes) => Frame::new(true, OpCode::Binary, None, bytes),
        }
    }

    /// Returns the message payload as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Message::Binary(bytes)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::Binary(bytes.into())
    }
}

/// An in-progress fragmented message.
struct Pending {
    /// Opcode of the first fragment; decides Text or Binary.
    opcode: OpCode,
    /// Total bytes buffered so far.
    bytes_read: usize,
    parts: VecDeque<Bytes>,
}

/// Accumulates data frames into complete [`Message`]s.
///
/// Only data frames may be pushed; control frames are handled before
/// reassembly by the connection's read loop.
pub struct MessageAssembler {
    pending: Option<Pending>,
    max_message_size: usize,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: None,
            max_message_size,
        }
    }

    /// Feeds one data frame, returning a message when the frame completes
    /// one.
    ///
    /// Errors returned here are fatal to the connection: interleaved data
    /// messages, stray continuations, invalid UTF-8 in a text message and
    /// messages growing past the configured ceiling.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, WsError> {
        match frame.opcode() {
            OpCode::Text | OpCode::Binary => {
                if self.pending.is_some() {
                    // A new data message may not begin mid-fragmentation.
                    return Err(WsError::InvalidFragment);
                }
                if frame.is_fin() {
                    if frame.payload().len() > self.max_message_size {
                        return Err(WsError::MessageTooLarge {
                            size: frame.payload().len(),
                            max_size: self.max_message_size,
                        });
                    }
                    return Self::finish(frame.opcode(), frame.into_payload());
                }
                let mut pending = Pending {
                    opcode: frame.opcode(),
                    bytes_read: 0,
                    parts: VecDeque::new(),
                };
                self.accumulate(&mut pending, frame.into_payload())?;
                self.pending = Some(pending);
                Ok(None)
            }
            OpCode::Continuation => {
                let mut pending = self.pending.take().ok_or(WsError::InvalidFragment)?;
                let fin = frame.is_fin();
                self.accumulate(&mut pending, frame.into_payload())?;
                if !fin {
                    self.pending = Some(pending);
                    return Ok(None);
                }
                let mut buf = BytesMut::with_capacity(pending.bytes_read);
                for part in pending.parts {
                    buf.extend_from_slice(&part);
                }
                Self::finish(pending.opcode, buf.freeze())
            }
            _ => Err(WsError::InvalidFragment),
        }
    }

    fn accumulate(&self, pending: &mut Pending, payload: Bytes) -> Result<(), WsError> {
        pending.bytes_read += payload.len();
        if pending.bytes_read > self.max_message_size {
            return Err(WsError::MessageTooLarge {
                size: pending.bytes_read,
                max_size: self.max_message_size,
            });
        }
        pending.parts.push_back(payload);
        Ok(())
    }

    fn finish(opcode: OpCode, payload: Bytes) -> Result<Option<Message>, WsError> {
        let message = match opcode {
            OpCode::Text => {
                let text =
                    String::from_utf8(payload.into()).map_err(|_| WsError::InvalidUtf8)?;
                Message::Text(text)
            }
            _ => Message::Binary(payload),
        };
        Ok(Some(message))
    }
}
