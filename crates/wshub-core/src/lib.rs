//! # wshub-core
//!
//! Shared library for wshub containing the WebSocket wire codec, the HTTP
//! upgrade handshake negotiator and the IPC envelope types.
//!
//! It has zero dependencies on sockets, event loops, or application logic,
//! so every piece can be tested with plain byte slices.
//!
//! # Architecture overview (for beginners)
//!
//! wshub is a single-process WebSocket server.  A browser opens a TCP
//! connection, sends an HTTP `GET` asking to "upgrade" to WebSocket, and from
//! then on both sides exchange small binary *frames*.  Local processes can
//! also inject messages through a datagram socket (the *IPC channel*).
//!
//! This crate (`wshub-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the wire.  `frame` turns payloads
//!   into RFC 6455 frames and back, `close` holds the close status table, and
//!   `handshake` validates the upgrade request and builds the response.
//!
//! - **`ipc`** – The JSON envelope used by local processes to talk to the
//!   running server.

pub mod ipc;
pub mod protocol;

pub use ipc::envelope::{IpcData, IpcError, IpcMessage, MAX_DATAGRAM_SIZE};
pub use protocol::close::CloseCode;
pub use protocol::frame::{decode_frame, encode_frame, DecodeStatus, Frame, FrameError, Opcode};
pub use protocol::handshake::{negotiate, HandshakeError, HandshakePolicy, Negotiated};
