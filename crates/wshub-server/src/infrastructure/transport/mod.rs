//! Byte sinks a [`Connection`](crate::infrastructure::connection::Connection)
//! writes to.
//!
//! The event loop reads from the concrete `mio` socket itself and hands the
//! bytes to the connection, so a transport only needs the write half plus a
//! way to shut the socket down.  Unit tests substitute
//! [`mock::RecordingTransport`].

pub mod mock;

use std::io::{self, Write};
use std::net::Shutdown;

/// Write half of an accepted socket.
pub trait Transport: Write {
    /// Shuts down both directions.  Errors for an already-closed socket are
    /// not interesting to callers and may be ignored.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl Transport for mio::net::TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Both)
    }
}
