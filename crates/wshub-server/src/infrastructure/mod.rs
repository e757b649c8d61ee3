//! Infrastructure layer for wshub-server.
//!
//! The infrastructure layer owns every socket and file handle.
//!
//! # Responsibilities
//!
//! - Binding the TCP listener and running the `mio` event loop
//! - Driving each accepted socket through handshake, frames and close
//! - Receiving IPC datagrams from local processes
//! - Loading the TOML configuration file
//!
//! # What does NOT belong here?
//!
//! - Application behaviour (that is the application layer)
//! - Wire formats (those live in `wshub-core`)

pub mod connection;
pub mod ipc;
pub mod server;
pub mod storage;
pub mod transport;

pub use server::{Server, ServerError};
