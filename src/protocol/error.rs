//! Error taxonomy for the handshake, the frame codec and the session

use crate::models::CloseCode;
use std::io;
use thiserror::Error;

/// Why an upgrade request was refused. Surfaced to the client as HTTP 400;
/// the connection is never upgraded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("required header {0} is missing or malformed")]
    MissingHeader(&'static str),
    #[error("unsupported Sec-WebSocket-Version {0:?}, expected 13")]
    InvalidVersion(String),
    #[error("Sec-WebSocket-Key is not a base64 encoded 16 byte nonce")]
    InvalidKey,
    #[error("upgrade requests must use GET, got {0}")]
    InvalidMethod(String),
}

/// Protocol violations found while decoding or reassembling inbound frames.
/// Every variant is fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameDecodeError {
    #[error("reserved header bits are set")]
    ReservedBitsSet,
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("64-bit payload length has its most significant bit set")]
    InvalidLength,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),
    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,
    #[error("client frames must be masked")]
    UnmaskedFrame,
    #[error("payload of {size} bytes exceeds the limit of {limit}")]
    MessageTooBig { size: u64, limit: u64 },
    #[error("data frame arrived out of fragmentation sequence")]
    UnexpectedDataFrame,
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed close frame payload")]
    InvalidClosePayload,
}

impl FrameDecodeError {
    /// Status code sent in the Close frame that ends the connection
    pub fn close_code(&self) -> CloseCode {
        match self {
            FrameDecodeError::InvalidUtf8 => CloseCode::InvalidPayload,
            FrameDecodeError::MessageTooBig { .. } => CloseCode::MessageTooBig,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Errors that end a connection session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameDecodeError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("peer idle for longer than the configured timeout")]
    Timeout,
    #[error("connection is closed")]
    ConnectionClosed,
}

impl SessionError {
    /// Code reported to the application for this failure
    pub fn close_code(&self) -> CloseCode {
        match self {
            SessionError::Protocol(err) => err.close_code(),
            SessionError::Io(_) | SessionError::Timeout => CloseCode::Abnormal,
            SessionError::ConnectionClosed => CloseCode::Normal,
        }
    }
}
