//! Close handshake models (RFC 6455 section 7)

use crate::protocol::FrameDecodeError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Close status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    Unsupported,
    /// 1005, reported locally when the peer's Close carried no code
    NoStatusReceived,
    /// 1006, reported locally when the transport went away without a Close
    Abnormal,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1010
    MandatoryExtension,
    /// 1011
    InternalError,
    Other(u16),
}

impl CloseCode {
    /// Whether the code may appear in a Close frame on the wire.
    /// 1004-1006 and 1015 are reserved, 3000-4999 are for libraries and
    /// applications, everything else outside the registered 1000-1014 block is
    /// invalid.
    pub fn is_valid_on_wire(self) -> bool {
        matches!(u16::from(self), 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatusReceived,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Parsed Close frame payload
///
/// - empty: no code, no reason
/// - 2 bytes: big-endian status code
/// - more: status code followed by UTF-8 reason text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReason {
    pub code: Option<CloseCode>,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }

    /// Parse a Close payload received from the peer
    pub fn parse(payload: &[u8]) -> Result<Self, FrameDecodeError> {
        match payload.len() {
            0 => Ok(Self::default()),
            1 => Err(FrameDecodeError::InvalidClosePayload),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_valid_on_wire() {
                    return Err(FrameDecodeError::InvalidClosePayload);
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| FrameDecodeError::InvalidUtf8)?
                    .to_string();
                Ok(Self {
                    code: Some(code),
                    reason,
                })
            }
        }
    }

    /// Encode as a Close payload. The reason is cut on a char boundary so the
    /// payload stays within the 125-byte control frame limit.
    pub fn encode(&self) -> Bytes {
        let Some(code) = self.code else {
            return Bytes::new();
        };
        let mut cut = self.reason.len().min(123);
        while !self.reason.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut buf = BytesMut::with_capacity(2 + cut);
        buf.put_u16(code.into());
        buf.put_slice(&self.reason.as_bytes()[..cut]);
        buf.freeze()
    }

    /// Code to report to the application, NoStatusReceived when absent
    pub fn code_or_no_status(&self) -> CloseCode {
        self.code.unwrap_or(CloseCode::NoStatusReceived)
    }
}

/// Close handshake progress of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseState {
    Open,
    /// We sent Close and are waiting for the peer's
    CloseSent,
    /// The peer sent Close and our echo is pending
    CloseReceived,
    Closed,
}

impl CloseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseState::Open => "OPEN",
            CloseState::CloseSent => "CLOSE_SENT",
            CloseState::CloseReceived => "CLOSE_RECEIVED",
            CloseState::Closed => "CLOSED",
        }
    }
}
