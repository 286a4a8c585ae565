//! WebSocket frame and message models
//!
//! Represents the wire units and the application messages assembled from them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Maximum payload a control frame may carry (RFC 6455 5.5)
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Continuation frame
    Continuation,
    /// Text frame (UTF-8 encoded)
    Text,
    /// Binary frame
    Binary,
    /// Connection close frame
    Close,
    /// Ping frame
    Ping,
    /// Pong frame
    Pong,
}

impl Opcode {
    /// Parse from the low nibble of the first header byte.
    /// Reserved values (3-7, 0xB-0xF) yield `None`.
    pub fn from_u8(opcode: u8) -> Option<Self> {
        match opcode & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Raw 4-bit wire value
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Close, Ping and Pong
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Text and Binary (Continuation is neither data nor control on its own)
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Continuation => "CONTINUATION",
            Opcode::Text => "TEXT",
            Opcode::Binary => "BINARY",
            Opcode::Close => "CLOSE",
            Opcode::Ping => "PING",
            Opcode::Pong => "PONG",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded wire frame. The payload is always stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    pub opcode: Opcode,
    /// Whether the frame arrived masked (client to server frames must be)
    pub masked: bool,
    pub payload_len: u64,
    /// Key the payload was masked with, present iff `masked`
    pub masking_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    /// Build an unmasked frame, as the server sends them
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>, fin: bool) -> Self {
        let payload = payload.into();
        Self {
            fin,
            opcode,
            masked: false,
            payload_len: payload.len() as u64,
            masking_key: None,
            payload,
        }
    }

    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }
}

/// Kind of an application message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    /// Data opcode carried by the first frame of a message of this kind
    pub fn opcode(self) -> Opcode {
        match self {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        }
    }

    pub fn from_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::Text => Some(MessageKind::Text),
            Opcode::Binary => Some(MessageKind::Binary),
            _ => None,
        }
    }
}

/// Application-level message assembled from one or more frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Message bytes; valid UTF-8 when `kind` is `Text`
    pub data: Bytes,
    /// False only while a fragmented sequence is still open
    pub is_complete: bool,
}

impl Message {
    /// Create a complete text message
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            data: Bytes::from(text.into()),
            is_complete: true,
        }
    }

    /// Create a complete binary message
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            data: data.into(),
            is_complete: true,
        }
    }

    /// Get the payload as text (only for text messages)
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.data).ok(),
            MessageKind::Binary => None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get a preview of the payload (first 100 chars) for log lines
    pub fn preview(&self) -> String {
        match self.as_text() {
            Some(text) => match text.char_indices().nth(100) {
                Some((cut, _)) => format!("{}...", &text[..cut]),
                None => text.to_string(),
            },
            None => format!("[Binary: {} bytes]", self.data.len()),
        }
    }
}
