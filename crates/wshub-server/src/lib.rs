//! wshub-server library crate.
//!
//! A single-process WebSocket server: it accepts many concurrent browser
//! connections, performs the upgrade handshake, routes text messages to named
//! *applications*, and accepts out-of-band messages from local processes over
//! a datagram socket.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Browser (WebSocket)        local process (IPC datagram)
//!         ↕                              ↓
//! [wshub-server]
//!   ├── domain/           Pure types: ServerConfig, ClientInfo, ConnectionId
//!   ├── application/      Applications, registry, admission control, timers
//!   └── infrastructure/
//!         ├── server/     mio event loop tying everything together
//!         ├── connection/ Per-socket handshake → open → closed state machine
//!         ├── ipc/        Non-blocking datagram listener
//!         └── storage/    TOML configuration loading
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O.
//! - `application` depends on `domain` and `wshub-core` only; applications
//!   never touch sockets, they queue commands on an [`application::Outbox`].
//! - `infrastructure` owns every socket and file handle.
//!
//! # Concurrency model
//!
//! Everything runs on one thread.  Each loop iteration runs due timers, polls
//! sockets with a short bounded wait, handles ready sockets, then drains the
//! IPC channel.  Application callbacks run to completion and block the whole
//! server while they do, so they must stay short.

/// Domain layer: configuration and client identity (no I/O).
pub mod domain;

/// Application layer: application trait, registry, admission and timers.
pub mod application;

/// Infrastructure layer: event loop, connections, IPC socket, config files.
pub mod infrastructure;

pub use application::{Application, ApplicationRegistry, Outbox};
pub use domain::{ClientInfo, ConnectionId, ServerConfig};
pub use infrastructure::server::Server;
