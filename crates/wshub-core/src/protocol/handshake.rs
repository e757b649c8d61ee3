//! HTTP upgrade handshake negotiation.
//!
//! # How the handshake works (for beginners)
//!
//! A WebSocket connection starts life as an ordinary HTTP request:
//!
//! ```text
//! GET /echo HTTP/1.1
//! Host: example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! Origin: http://example.com
//! ```
//!
//! The path names the *application* the client wants to talk to.  If the
//! request passes every check, the server answers `101 Switching Protocols`
//! with a `Sec-WebSocket-Accept` header proving it understood the key:
//!
//! ```text
//! accept = base64( sha1( key + "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" ) )
//! ```
//!
//! Any failed check maps to a plain HTTP status line (see
//! [`HandshakeError::status`]) and the connection is dropped.
//!
//! This module only inspects bytes and builds responses; writing them to a
//! socket is the caller's job.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Lowest `Sec-WebSocket-Version` accepted.
pub const MIN_WEBSOCKET_VERSION: u32 = 6;

/// Terminator separating the request head from anything that follows.
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// HTTP statuses used to reject an upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    BadRequest,
    Unauthorized,
    NotFound,
    NotImplemented,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        match self {
            HttpStatus::BadRequest => 400,
            HttpStatus::Unauthorized => 401,
            HttpStatus::NotFound => 404,
            HttpStatus::NotImplemented => 501,
        }
    }

    pub fn reason_phrase(self) -> &'static str {
        match self {
            HttpStatus::BadRequest => "Bad Request",
            HttpStatus::Unauthorized => "Unauthorized",
            HttpStatus::NotFound => "Not Found",
            HttpStatus::NotImplemented => "Not Implemented",
        }
    }

    /// Full rejection response: status line plus the empty line ending the head.
    pub fn response(self) -> Vec<u8> {
        format!("HTTP/1.1 {} {}\r\n\r\n", self.code(), self.reason_phrase()).into_bytes()
    }
}

/// Reasons an upgrade request is refused.
#[derive(Debug, Error, PartialEq)]
pub enum HandshakeError {
    /// The request head is not valid UTF-8.
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,

    /// The request line is not `GET <path> HTTP/1.1`.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// No terminating blank line arrived within the size limit.
    #[error("request head exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// The path does not name a registered application.
    #[error("no application registered under {0:?}")]
    UnknownApplication(String),

    /// `Sec-WebSocket-Version` is absent, not a number, or too old.
    #[error("unsupported websocket version: {0:?}")]
    UnsupportedVersion(Option<String>),

    /// Origin checking is enabled and neither origin header is present.
    #[error("request carries no origin header")]
    MissingOrigin,

    /// The normalised origin is not in the allow-list.
    #[error("origin {0:?} is not allowed")]
    OriginNotAllowed(String),

    /// `Sec-WebSocket-Key` is absent.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

impl HandshakeError {
    /// HTTP status written back for this rejection.
    pub fn status(&self) -> HttpStatus {
        match self {
            HandshakeError::InvalidEncoding
            | HandshakeError::MalformedRequestLine(_)
            | HandshakeError::TooLarge { .. }
            | HandshakeError::MissingKey => HttpStatus::BadRequest,
            HandshakeError::UnknownApplication(_) => HttpStatus::NotFound,
            HandshakeError::UnsupportedVersion(_) => HttpStatus::NotImplemented,
            HandshakeError::MissingOrigin | HandshakeError::OriginNotAllowed(_) => {
                HttpStatus::Unauthorized
            }
        }
    }
}

/// Origin and version rules applied to every upgrade request.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakePolicy {
    pub check_origin: bool,
    /// Normalised origins (see [`normalize_origin`]).
    pub allowed_origins: HashSet<String>,
    pub min_version: u32,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            check_origin: false,
            allowed_origins: HashSet::new(),
            min_version: MIN_WEBSOCKET_VERSION,
        }
    }
}

impl HandshakePolicy {
    /// Builds a policy, normalising each allow-list entry.
    pub fn new<I, S>(check_origin: bool, allowed_origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            check_origin,
            allowed_origins: allowed_origins
                .into_iter()
                .map(|origin| normalize_origin(origin.as_ref()))
                .collect(),
            min_version: MIN_WEBSOCKET_VERSION,
        }
    }

    /// Whether `origin` (raw header value) passes the allow-list.
    pub fn allows(&self, origin: &str) -> bool {
        self.allowed_origins.contains(&normalize_origin(origin))
    }
}

/// A parsed upgrade request head.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeRequest {
    /// Request path as sent, including any query string.
    pub path: String,
    /// Application name: the path without its leading `/` or query string.
    pub application: String,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup.  The first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    /// Name of the application the connection binds to.
    pub application: String,
    /// Subprotocol echoed back to the client, if any.
    pub protocol: Option<String>,
    /// Complete `101 Switching Protocols` response.
    pub response: Vec<u8>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Returns the length of the request head including its terminating blank
/// line, or `None` while the terminator has not arrived.
pub fn find_request_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// # Examples
///
/// ```rust
/// use wshub_core::protocol::handshake::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Reduces an origin to a bare host for allow-list comparison.
///
/// Strips an `http://` or `https://` scheme, then a leading `www.`, then
/// everything from the first `/`.  The result is lower-cased.
pub fn normalize_origin(origin: &str) -> String {
    let lowered = origin.trim().to_ascii_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(lowered.as_str());
    let without_www = without_scheme
        .strip_prefix("www.")
        .unwrap_or(without_scheme);
    without_www
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Parses the request line and headers of an upgrade request.
///
/// # Errors
///
/// Returns [`HandshakeError::MalformedRequestLine`] unless the first line is
/// exactly `GET <path> HTTP/1.1`.
pub fn parse_request(head: &str) -> Result<UpgradeRequest, HandshakeError> {
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();

    let parts: Vec<&str> = request_line.split(' ').collect();
    let path = match parts.as_slice() {
        ["GET", path, "HTTP/1.1"] if !path.is_empty() => *path,
        _ => {
            return Err(HandshakeError::MalformedRequestLine(
                request_line.to_string(),
            ))
        }
    };

    let route = path.split('?').next().unwrap_or_default();
    let application = route.strip_prefix('/').unwrap_or(route).to_string();

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(UpgradeRequest {
        path: path.to_string(),
        application,
        headers,
    })
}

/// Validates an upgrade request head and builds the `101` response.
///
/// `is_registered` answers whether an application exists under a name.
/// Checks run in this order: request line (400), application (404),
/// version (501), origin (401), key (400).
///
/// # Errors
///
/// Returns the first [`HandshakeError`] encountered; map it to a response
/// with [`HandshakeError::status`].
pub fn negotiate<F>(
    head: &[u8],
    policy: &HandshakePolicy,
    is_registered: F,
) -> Result<Negotiated, HandshakeError>
where
    F: Fn(&str) -> bool,
{
    let head = std::str::from_utf8(head).map_err(|_| HandshakeError::InvalidEncoding)?;
    let request = parse_request(head)?;

    if !is_registered(&request.application) {
        return Err(HandshakeError::UnknownApplication(request.application));
    }

    let version = request.header("Sec-WebSocket-Version");
    match version.map(|v| v.parse::<u32>()) {
        Some(Ok(v)) if v >= policy.min_version => {}
        _ => {
            return Err(HandshakeError::UnsupportedVersion(
                version.map(str::to_string),
            ))
        }
    }

    if policy.check_origin {
        let origin = request
            .header("Origin")
            .or_else(|| request.header("Sec-WebSocket-Origin"))
            .ok_or(HandshakeError::MissingOrigin)?;
        if !policy.allows(origin) {
            return Err(HandshakeError::OriginNotAllowed(origin.to_string()));
        }
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    let protocol = request.header("Sec-WebSocket-Protocol").and_then(|offered| {
        let mut offered = offered.split(',').map(str::trim).filter(|p| !p.is_empty());
        let first = offered.clone().next();
        offered
            .find(|p| *p == request.application)
            .or(first)
            .map(str::to_string)
    });

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        compute_accept_key(key)
    );
    if let Some(protocol) = &protocol {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(protocol);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");

    debug!(application = %request.application, "handshake accepted");

    Ok(Negotiated {
        application: request.application,
        protocol,
        response: response.into_bytes(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
