//! TCP transport for the matrix chat service.
//!
//! Provides:
//! - Wire protocol text for every server line
//! - `ChatServer` - Listener and accept loop
//! - Per-connection receive loop and send task

pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use connection::SessionError;
pub use protocol::ServerMessage;
pub use server::{ChatServer, ServerError};
