//! # WebSocket Server Core
//!
//! Server side of RFC 6455: opening handshake, frame codec, fragmentation
//! reassembly and a per-connection session that hands complete messages to
//! an application handler.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Application (SessionHandler)             │
//! ├─────────────────────────────────────────────────────────┤
//! │   api::server_api  ──  server::listener  ──  server::http│
//! ├─────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌─────────┐  ┌─────────────┐  ┌───────┐ │
//! │  │ Handshake │  │  Frame  │  │ Reassembler │  │Session│ │
//! │  │ Validator │──│  Codec  │──│             │──│       │ │
//! │  └───────────┘  └─────────┘  └─────────────┘  └───────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```

// Public modules
pub mod api;
pub mod models;
pub mod protocol;
pub mod server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
