//! Domain layer for wshub-server.
//!
//! Pure types with no dependencies on sockets, files, or the event loop:
//!
//! - Configuration structures (deserialised by the storage layer)
//! - Connection identity types handed to applications

pub mod client;
pub mod config;

pub use client::{ClientInfo, ConnectionId};
pub use config::{
    InvalidConfig, IpcConfig, LimitsConfig, ListenConfig, OriginConfig, ServerConfig,
};
