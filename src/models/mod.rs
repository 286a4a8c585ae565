//! Data models for the WebSocket server
//!
//! Wire frames, application messages and close handshake types shared by the
//! codec, the reassembler and the session.

pub mod close;
pub mod websocket;

pub use close::*;
pub use websocket::*;
