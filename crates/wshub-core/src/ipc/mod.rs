//! IPC module containing the local control-channel envelope.

pub mod envelope;

pub use envelope::{IpcData, IpcError, IpcMessage, MAX_DATAGRAM_SIZE};
