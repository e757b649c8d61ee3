//! In-memory transport for unit testing connections.
//!
//! # Why a mock transport?
//!
//! A real socket needs a peer, and its non-blocking behaviour depends on
//! kernel buffer sizes the test cannot control.  `RecordingTransport`
//! appends every written byte to `written` so assertions can decode exactly
//! what the server sent, and can simulate the two failure modes that matter:
//!
//! - `should_fail`: every write returns `BrokenPipe`.
//! - `write_budget`: accept only that many more bytes, then `WouldBlock`.

use std::io::{self, Write};

use super::Transport;

/// A transport that records writes instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    /// Every byte accepted so far, in order.
    pub written: Vec<u8>,
    /// Set once `shutdown` has been called.
    pub shut_down: bool,
    /// When `true`, every write fails with `BrokenPipe`.
    pub should_fail: bool,
    /// Remaining bytes accepted before writes return `WouldBlock`.
    /// `None` means unlimited.
    pub write_budget: Option<usize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns and clears everything written so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }
}

impl Write for RecordingTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.should_fail {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock failure"));
        }
        let accepted = match self.write_budget {
            Some(0) if !buf.is_empty() => {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "mock full"))
            }
            Some(budget) => {
                let n = budget.min(buf.len());
                self.write_budget = Some(budget - n);
                n
            }
            None => buf.len(),
        };
        self.written.extend_from_slice(&buf[..accepted]);
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn shutdown(&mut self) -> io::Result<()> {
        self.shut_down = true;
        Ok(())
    }
}
