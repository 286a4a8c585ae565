//! WebSocket protocol core: handshake validation, frame codec,
//! fragmentation reassembly and the per-connection session.

pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod reassembler;
pub mod session;

pub use error::*;
pub use frame::{decode_frame, decode_frame_with_limit, encode_frame, encode_masked_frame, Decoded};
pub use handler::*;
pub use handshake::{compute_accept_key, validate, AcceptKey, HandshakeRequest, WS_GUID, WS_VERSION};
pub use reassembler::*;
pub use session::*;
