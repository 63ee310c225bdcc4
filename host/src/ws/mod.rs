//! Browser WebSocket connections.

pub mod connection;
pub mod handler;
pub mod types;

pub use connection::Connection;
pub use types::{ClientMessage, ServerFrame, WsError};
