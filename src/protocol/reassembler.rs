//! Fragmentation reassembly (RFC 6455 section 5.4)
//!
//! Stitches a Text/Binary frame and its Continuation frames into one message.
//! Control frames are handled by the session and never pass through here, so
//! they can interleave with a fragmented message without disturbing it.

use crate::models::{Frame, Message, MessageKind, Opcode};
use crate::protocol::FrameDecodeError;
use bytes::{Bytes, BytesMut};

/// Default cap on an assembled message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    Idle,
    Accumulating,
}

/// Message whose final fragment has not arrived yet
#[derive(Debug)]
struct PartialMessage {
    kind: MessageKind,
    data: BytesMut,
    fragments: usize,
}

/// Per-connection reassembly state machine
#[derive(Debug)]
pub struct Reassembler {
    partial: Option<PartialMessage>,
    max_message_size: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            partial: None,
            max_message_size,
        }
    }

    pub fn state(&self) -> ReassemblyState {
        if self.partial.is_some() {
            ReassemblyState::Accumulating
        } else {
            ReassemblyState::Idle
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.partial.is_some()
    }

    /// Bytes held for the open fragmented message
    pub fn buffered_len(&self) -> usize {
        self.partial.as_ref().map(|p| p.data.len()).unwrap_or(0)
    }

    /// Feed one data frame. Returns the message once its final fragment has
    /// arrived, `None` while still accumulating. Control frames are refused
    /// with `UnexpectedDataFrame` and leave any open message untouched.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameDecodeError> {
        let kind = match (frame.opcode, self.partial.take()) {
            (Opcode::Continuation, Some(partial)) => return self.extend(partial, frame),
            (Opcode::Continuation, None) | (Opcode::Text | Opcode::Binary, Some(_)) => {
                return Err(FrameDecodeError::UnexpectedDataFrame);
            }
            (Opcode::Close | Opcode::Ping | Opcode::Pong, partial) => {
                self.partial = partial;
                return Err(FrameDecodeError::UnexpectedDataFrame);
            }
            (Opcode::Text, None) => MessageKind::Text,
            (Opcode::Binary, None) => MessageKind::Binary,
        };

        self.check_size(frame.payload.len())?;
        if frame.fin {
            return finish(kind, frame.payload).map(Some);
        }
        let mut data = BytesMut::with_capacity(frame.payload.len());
        data.extend_from_slice(&frame.payload);
        self.partial = Some(PartialMessage {
            kind,
            data,
            fragments: 1,
        });
        Ok(None)
    }

    fn extend(
        &mut self,
        mut partial: PartialMessage,
        frame: Frame,
    ) -> Result<Option<Message>, FrameDecodeError> {
        let size = partial.data.len() + frame.payload.len();
        if size > self.max_message_size {
            return Err(FrameDecodeError::MessageTooBig {
                size: size as u64,
                limit: self.max_message_size as u64,
            });
        }
        partial.data.extend_from_slice(&frame.payload);
        partial.fragments += 1;
        if !frame.fin {
            self.partial = Some(partial);
            return Ok(None);
        }
        tracing::trace!(
            "Reassembled {:?} message from {} fragments",
            partial.kind,
            partial.fragments
        );
        finish(partial.kind, partial.data.freeze()).map(Some)
    }

    /// Drop any half-assembled message
    pub fn reset(&mut self) {
        self.partial = None;
    }

    fn check_size(&self, size: usize) -> Result<(), FrameDecodeError> {
        if size > self.max_message_size {
            return Err(FrameDecodeError::MessageTooBig {
                size: size as u64,
                limit: self.max_message_size as u64,
            });
        }
        Ok(())
    }
}

fn finish(kind: MessageKind, data: Bytes) -> Result<Message, FrameDecodeError> {
    if kind == MessageKind::Text && std::str::from_utf8(&data).is_err() {
        return Err(FrameDecodeError::InvalidUtf8);
    }
    Ok(Message {
        kind,
        data,
        is_complete: true,
    })
}
