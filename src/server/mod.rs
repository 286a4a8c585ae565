//! TCP host for the protocol core

pub mod http;
pub mod listener;

pub use listener::{handle_connection, run_server, HandlerFactory};
