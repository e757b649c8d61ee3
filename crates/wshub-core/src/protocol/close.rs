//! Close status codes and close-frame payloads.
//!
//! A close payload is the big-endian 16-bit status code followed by a short
//! UTF-8 reason.  The server only ever sends codes from the fixed table below.

use std::fmt;

/// Close status codes the server sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    TooLarge = 1004,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
}

impl CloseCode {
    /// Numeric status code as written on the wire.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Fixed human-readable reason sent after the status code.
    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::Normal => "normal closure",
            CloseCode::GoingAway => "going away",
            CloseCode::ProtocolError => "protocol error",
            CloseCode::UnsupportedData => "unknown data (opcode)",
            CloseCode::TooLarge => "frame too large",
            CloseCode::InvalidPayload => "utf8 expected",
            CloseCode::PolicyViolation => "message violates server policy",
        }
    }

    /// Looks up a code from the table.  Codes outside it return `None`.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::Normal),
            1001 => Some(CloseCode::GoingAway),
            1002 => Some(CloseCode::ProtocolError),
            1003 => Some(CloseCode::UnsupportedData),
            1004 => Some(CloseCode::TooLarge),
            1007 => Some(CloseCode::InvalidPayload),
            1008 => Some(CloseCode::PolicyViolation),
            _ => None,
        }
    }

    /// Builds the close-frame payload: status code then reason.
    pub fn payload(self) -> Vec<u8> {
        let reason = self.reason().as_bytes();
        let mut buf = Vec::with_capacity(2 + reason.len());
        buf.extend_from_slice(&self.code().to_be_bytes());
        buf.extend_from_slice(reason);
        buf
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}

/// Splits a received close payload into its status code and reason.
///
/// An empty payload carries no status; a single byte is malformed and is
/// treated the same way.  Invalid UTF-8 in the reason is replaced lossily.
pub fn parse_close_payload(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some((code, reason))
}
