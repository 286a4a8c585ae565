//! WebSocket frame codec
//!
//! Parses and builds WebSocket frames according to RFC 6455 section 5.2.
//! The decoder works on whatever prefix of the stream has been buffered so
//! far and reports exactly how many bytes a complete frame consumed.

use crate::models::{Frame, Opcode, MAX_CONTROL_PAYLOAD};
use crate::protocol::FrameDecodeError;
use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload length the 64-bit length field may carry (top bit clear)
pub const MAX_PAYLOAD_LEN: u64 = i64::MAX as u64;

/// Parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload_len: u64,
    pub mask_key: Option<[u8; 4]>,
    /// Bytes occupied by the header, masking key included
    pub header_len: usize,
}

/// Outcome of a decode attempt that found no protocol violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// More bytes are required; `needed` is the minimum still missing
    Incomplete { needed: usize },
    /// A complete frame occupying the first `consumed` bytes of the buffer
    Frame { frame: Frame, consumed: usize },
}

/// Result of looking at the front of the buffer for a header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderStatus {
    Complete(FrameHeader),
    Partial { needed: usize },
}

/// Parse a WebSocket frame header from the buffer.
/// Returns `HeaderStatus::Partial` if not enough data is available yet.
pub fn parse_frame_header(data: &[u8]) -> Result<HeaderStatus, FrameDecodeError> {
    if data.len() < 2 {
        return Ok(HeaderStatus::Partial {
            needed: 2 - data.len(),
        });
    }

    let fin = (data[0] & 0x80) != 0;
    if data[0] & 0x70 != 0 {
        return Err(FrameDecodeError::ReservedBitsSet);
    }
    let raw_opcode = data[0] & 0x0F;
    let opcode = Opcode::from_u8(raw_opcode).ok_or(FrameDecodeError::ReservedOpcode(raw_opcode))?;
    let masked = (data[1] & 0x80) != 0;
    let len7 = data[1] & 0x7F;

    if opcode.is_control() {
        if !fin {
            return Err(FrameDecodeError::FragmentedControlFrame);
        }
        if usize::from(len7) > MAX_CONTROL_PAYLOAD {
            // 126 and 127 announce an extended length, which is always > 125
            return Err(FrameDecodeError::ControlFrameTooLarge(u64::from(len7)));
        }
    }

    let mut offset = 2;
    let payload_len = match len7 {
        126 => {
            if data.len() < offset + 2 {
                return Ok(HeaderStatus::Partial {
                    needed: offset + 2 - data.len(),
                });
            }
            let len = u16::from_be_bytes([data[offset], data[offset + 1]]);
            offset += 2;
            u64::from(len)
        }
        127 => {
            if data.len() < offset + 8 {
                return Ok(HeaderStatus::Partial {
                    needed: offset + 8 - data.len(),
                });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[offset..offset + 8]);
            offset += 8;
            let len = u64::from_be_bytes(raw);
            if len > MAX_PAYLOAD_LEN {
                return Err(FrameDecodeError::InvalidLength);
            }
            len
        }
        short => u64::from(short),
    };

    // Masking key (only present for client -> server frames)
    let mask_key = if masked {
        if data.len() < offset + 4 {
            return Ok(HeaderStatus::Partial {
                needed: offset + 4 - data.len(),
            });
        }
        let key = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    Ok(HeaderStatus::Complete(FrameHeader {
        fin,
        opcode,
        masked,
        payload_len,
        mask_key,
        header_len: offset,
    }))
}

/// Apply (or remove, the operation is its own inverse) a masking key in place
pub fn apply_mask(data: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Try to decode one complete frame from the front of `data`
pub fn decode_frame(data: &[u8]) -> Result<Decoded, FrameDecodeError> {
    decode_frame_with_limit(data, MAX_PAYLOAD_LEN)
}

/// Like [`decode_frame`], rejecting frames that announce more than
/// `max_payload` bytes before any of the payload is buffered
pub fn decode_frame_with_limit(data: &[u8], max_payload: u64) -> Result<Decoded, FrameDecodeError> {
    let header = match parse_frame_header(data)? {
        HeaderStatus::Complete(header) => header,
        HeaderStatus::Partial { needed } => return Ok(Decoded::Incomplete { needed }),
    };

    if header.payload_len > max_payload {
        return Err(FrameDecodeError::MessageTooBig {
            size: header.payload_len,
            limit: max_payload,
        });
    }
    let payload_len =
        usize::try_from(header.payload_len).map_err(|_| FrameDecodeError::MessageTooBig {
            size: header.payload_len,
            limit: usize::MAX as u64,
        })?;

    let total_len = header
        .header_len
        .checked_add(payload_len)
        .ok_or(FrameDecodeError::MessageTooBig {
            size: header.payload_len,
            limit: max_payload,
        })?;
    if data.len() < total_len {
        return Ok(Decoded::Incomplete {
            needed: total_len - data.len(),
        });
    }

    let mut payload = data[header.header_len..total_len].to_vec();
    if let Some(mask_key) = header.mask_key {
        apply_mask(&mut payload, mask_key);
    }

    let frame = Frame {
        fin: header.fin,
        opcode: header.opcode,
        masked: header.masked,
        payload_len: header.payload_len,
        masking_key: header.mask_key,
        payload: Bytes::from(payload),
    };

    Ok(Decoded::Frame {
        frame,
        consumed: total_len,
    })
}

fn put_header(buf: &mut BytesMut, opcode: Opcode, len: usize, fin: bool, mask_bit: u8) {
    let fin_bit = if fin { 0x80 } else { 0x00 };
    buf.put_u8(fin_bit | opcode.as_u8());
    // Minimal length encoding
    if len <= 125 {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }
}

fn header_capacity(len: usize) -> usize {
    match len {
        0..=125 => 2,
        126..=65535 => 4,
        _ => 10,
    }
}

/// Encode a server to client frame: never masked, header and payload in one
/// contiguous buffer so the caller can issue a single write
pub fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(header_capacity(payload.len()) + payload.len());
    put_header(&mut buf, opcode, payload.len(), fin, 0x00);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Encode a frame the way a client must send it, masked with `mask_key`
pub fn encode_masked_frame(opcode: Opcode, payload: &[u8], fin: bool, mask_key: [u8; 4]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(header_capacity(payload.len()) + 4 + payload.len());
    put_header(&mut buf, opcode, payload.len(), fin, 0x80);
    buf.put_slice(&mask_key);
    let start = buf.len();
    buf.put_slice(payload);
    apply_mask(&mut buf[start..], mask_key);
    buf.to_vec()
}

/// Encode a decoded frame back onto the wire, unmasked
pub fn encode(frame: &Frame) -> Vec<u8> {
    encode_frame(frame.opcode, &frame.payload, frame.fin)
}
