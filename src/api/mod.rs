//! Control surface for hosting the WebSocket server

pub mod server_api;

pub use server_api::{
    get_server_status, get_version, init_core, start_server, stop_server, ServerConfig,
    ServerStatus,
};
