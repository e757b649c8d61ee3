//! Per-socket WebSocket state machine.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!              101 sent                close frame / error / EOF
//! AwaitingHandshake ──────────▶ Open ─────────────────────────────▶ Closed
//!        │                                                            ▲
//!        └──────────── 400 / 401 / 404 / 501 sent ────────────────────┘
//!                      or handshake deadline passed
//! ```
//!
//! The event loop reads whatever bytes the socket has and calls
//! [`Connection::on_data`].  Those bytes are appended to a receive buffer:
//!
//! - While awaiting the handshake, the buffer grows until the blank line
//!   ending the HTTP request head arrives (or the size limit is exceeded).
//! - Once open, complete frames are decoded from the front of the buffer
//!   one by one.  A partial frame stays in the buffer silently until the
//!   next read completes it.
//!
//! Closing is synchronous: send the close frame, tell the bound application
//! (exactly once), shut the socket down.  The server notices
//! [`Connection::is_closed`] afterwards and drops its indices.
//!
//! Writes never block.  Bytes the kernel did not accept stay in a pending
//! buffer and are flushed when the socket becomes writable again.

use std::io::{self, ErrorKind, Write};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wshub_core::protocol::close::{parse_close_payload, CloseCode};
use wshub_core::protocol::frame::{
    decode_frame_limited, encode_frame, DecodeStatus, Frame, FrameError, Opcode,
};
use wshub_core::protocol::handshake::{
    find_request_end, negotiate, HandshakeError, HandshakePolicy, HttpStatus, Negotiated,
};

use crate::application::admission::RequestRateLimiter;
use crate::application::registry::{ApplicationError, ApplicationRegistry, Event, Outbox};
use crate::application::status::StatusLevel;
use crate::domain::config::LimitsConfig;
use crate::domain::ClientInfo;
use crate::infrastructure::transport::Transport;

/// Mask flag in the second header byte.
const MASK_BIT: u8 = 0x80;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Open,
    Closed,
}

/// Why a connection reached [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A close frame with this code was sent.
    Closed(CloseCode),
    /// The upgrade request was refused with this HTTP status.
    Rejected(HttpStatus),
    /// The peer closed the socket cleanly.
    PeerDisconnected,
    /// A read or write failed, or the peer vanished mid-frame.
    TransportError,
    /// No complete upgrade request arrived before the handshake deadline.
    HandshakeTimeout,
}

/// Limits enforced while receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_frame_size: u64,
    pub max_handshake_size: usize,
    /// `None` lets a socket wait for its upgrade request indefinitely.
    pub handshake_timeout: Option<Duration>,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl From<&LimitsConfig> for ConnectionLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_frame_size: limits.max_frame_size,
            max_handshake_size: limits.max_handshake_size,
            handshake_timeout: (limits.handshake_timeout_ms > 0)
                .then(|| Duration::from_millis(limits.handshake_timeout_ms)),
        }
    }
}

/// Server-owned state a connection needs while handling input.
pub struct Dispatch<'a> {
    pub applications: &'a mut ApplicationRegistry,
    pub outbox: &'a mut Outbox,
    pub policy: &'a HandshakePolicy,
    pub rate_limiter: Option<&'a mut RequestRateLimiter>,
}

/// One accepted socket and its protocol state.
pub struct Connection<T: Transport> {
    info: ClientInfo,
    transport: T,
    state: ConnectionState,
    /// Bound application; taken when `on_disconnect` has been delivered.
    application: Option<String>,
    handshaken: bool,
    buffer: Vec<u8>,
    pending_write: Vec<u8>,
    limits: ConnectionLimits,
    close_reason: Option<CloseReason>,
    accepted_at: Instant,
}

impl<T: Transport> Connection<T> {
    pub fn new(info: ClientInfo, transport: T, limits: ConnectionLimits) -> Self {
        Self {
            info,
            transport,
            state: ConnectionState::AwaitingHandshake,
            application: None,
            handshaken: false,
            buffer: Vec::new(),
            pending_write: Vec::new(),
            limits,
            close_reason: None,
            accepted_at: Instant::now(),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Name of the bound application while the connection is open.
    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    /// Whether the handshake ever completed.
    pub fn was_handshaken(&self) -> bool {
        self.handshaken
    }

    /// Whether an incomplete frame is buffered.
    pub fn awaiting_more_data(&self) -> bool {
        self.is_open() && !self.buffer.is_empty()
    }

    /// Whether queued bytes are waiting for the socket to become writable.
    pub fn wants_write(&self) -> bool {
        !self.pending_write.is_empty()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Whether the upgrade request is still missing past the deadline.
    pub fn handshake_overdue(&self, now: Instant) -> bool {
        match self.limits.handshake_timeout {
            Some(timeout) => {
                self.state == ConnectionState::AwaitingHandshake
                    && now.saturating_duration_since(self.accepted_at) >= timeout
            }
            None => false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ── Input ─────────────────────────────────────────────────────────────────

    /// Feeds bytes read from the socket.
    pub fn on_data(&mut self, bytes: &[u8], ctx: &mut Dispatch<'_>) {
        if self.is_closed() {
            return;
        }
        self.buffer.extend_from_slice(bytes);
        if self.state == ConnectionState::AwaitingHandshake {
            self.process_handshake(ctx);
        }
        if self.is_open() {
            self.process_frames(ctx);
        }
    }

    fn process_handshake(&mut self, ctx: &mut Dispatch<'_>) {
        let limit = self.limits.max_handshake_size;
        let end = match find_request_end(&self.buffer) {
            Some(end) if end <= limit => end,
            Some(_) => return self.reject(HandshakeError::TooLarge { limit }, ctx),
            None if self.buffer.len() > limit => {
                return self.reject(HandshakeError::TooLarge { limit }, ctx)
            }
            None => return,
        };

        let head: Vec<u8> = self.buffer.drain(..end).collect();
        let applications = &*ctx.applications;
        match negotiate(&head, ctx.policy, |name| applications.contains(name)) {
            Ok(negotiated) => self.accept(negotiated, ctx),
            Err(e) => self.reject(e, ctx),
        }
    }

    fn accept(&mut self, negotiated: Negotiated, ctx: &mut Dispatch<'_>) {
        self.pending_write.extend_from_slice(&negotiated.response);
        if let Err(e) = self.flush() {
            return self.fail(&e, ctx);
        }
        self.state = ConnectionState::Open;
        self.handshaken = true;
        info!(
            client = %self.info.key(),
            application = %negotiated.application,
            protocol = ?negotiated.protocol,
            "client connected"
        );

        let name = negotiated.application;
        if let Err(e) = ctx
            .applications
            .dispatch(&name, Event::Connect(&self.info), ctx.outbox)
        {
            report_application_error(&self.info, &name, "connect", e, ctx);
        }
        self.application = Some(name);

        if let Some(status) = ctx.applications.status_mut() {
            status.client_connected(self.info.ip(), self.info.port(), ctx.outbox);
        }
    }

    fn reject(&mut self, err: HandshakeError, ctx: &mut Dispatch<'_>) {
        let status = err.status();
        warn!(client = %self.info.key(), "handshake rejected with {}: {err}", status.code());
        self.pending_write.extend_from_slice(&status.response());
        if let Err(e) = self.flush() {
            debug!(client = %self.info.key(), "could not send rejection: {e}");
        }
        self.finish(CloseReason::Rejected(status), ctx);
    }

    fn process_frames(&mut self, ctx: &mut Dispatch<'_>) {
        while self.is_open() && !self.buffer.is_empty() {
            // Client frames must be masked; refuse on the header, not after
            // buffering a payload the peer may never finish.
            if self.buffer.len() >= 2 && self.buffer[1] & MASK_BIT == 0 {
                warn!(client = %self.info.key(), "unmasked client frame");
                return self.close(CloseCode::ProtocolError, ctx);
            }
            match decode_frame_limited(&self.buffer, self.limits.max_frame_size) {
                Ok(DecodeStatus::Incomplete { .. }) => break,
                Ok(DecodeStatus::Complete { frame, consumed }) => {
                    self.buffer.drain(..consumed);
                    self.handle_frame(frame, ctx);
                }
                Err(e @ FrameError::UnknownOpcode(_)) => {
                    warn!(client = %self.info.key(), "{e}");
                    self.close(CloseCode::UnsupportedData, ctx);
                }
                Err(e) => {
                    warn!(client = %self.info.key(), "{e}");
                    self.close(CloseCode::TooLarge, ctx);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, ctx: &mut Dispatch<'_>) {
        match frame.opcode {
            Opcode::Text => self.deliver_text(frame.payload, ctx),
            Opcode::Binary => {
                debug!(client = %self.info.key(), "binary frames are not supported");
                self.close(CloseCode::UnsupportedData, ctx);
            }
            Opcode::Ping => {
                if let Err(e) = self.send(&frame.payload, Opcode::Pong, false) {
                    self.fail(&e, ctx);
                }
            }
            Opcode::Pong => {}
            Opcode::Close => {
                if let Some((code, reason)) = parse_close_payload(&frame.payload) {
                    debug!(client = %self.info.key(), code, %reason, "client sent close");
                }
                self.close(CloseCode::Normal, ctx);
            }
        }
    }

    fn deliver_text(&mut self, payload: Vec<u8>, ctx: &mut Dispatch<'_>) {
        let limited = match ctx.rate_limiter.as_deref_mut() {
            Some(limiter) => limiter.check(self.info.id, Instant::now()).err(),
            None => None,
        };
        if let Some(e) = limited {
            warn!(client = %self.info.key(), "{e}");
            if let Some(status) = ctx.applications.status_mut() {
                let text = format!("Request limit for client {} was reached!", self.info.key());
                status.status_message(&text, StatusLevel::Warning, ctx.outbox);
            }
            return self.close(CloseCode::PolicyViolation, ctx);
        }

        let text = match String::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => {
                warn!(client = %self.info.key(), "text frame is not valid UTF-8");
                return self.close(CloseCode::InvalidPayload, ctx);
            }
        };

        if let Some(status) = ctx.applications.status_mut() {
            status.client_activity(&self.info.key(), ctx.outbox);
        }

        let Some(name) = self.application.as_deref() else {
            return;
        };
        if let Err(e) = ctx
            .applications
            .dispatch(name, Event::Data(&text, &self.info), ctx.outbox)
        {
            report_application_error(&self.info, name, "data", e, ctx);
        }
    }

    // ── Output ────────────────────────────────────────────────────────────────

    /// Encodes and queues one frame, then tries to flush.  Server frames are
    /// normally sent with `masked = false`.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the connection is open, or the write
    /// error from the transport.
    pub fn send(&mut self, payload: &[u8], opcode: Opcode, masked: bool) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                "connection is not open",
            ));
        }
        self.pending_write
            .extend_from_slice(&encode_frame(payload, opcode, masked));
        self.flush()
    }

    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send(text.as_bytes(), Opcode::Text, false)
    }

    /// Writes as much pending output as the socket accepts.
    ///
    /// # Errors
    ///
    /// Any write error other than `WouldBlock`.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.pending_write.is_empty() {
            match self.transport.write(&self.pending_write) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending_write.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Server-initiated close.  Sends a close frame if the connection is
    /// open, notifies the bound application and shuts the socket down.
    pub fn close(&mut self, code: CloseCode, ctx: &mut Dispatch<'_>) {
        if self.is_closed() {
            return;
        }
        if self.is_open() {
            self.pending_write
                .extend_from_slice(&encode_frame(&code.payload(), Opcode::Close, false));
            if let Err(e) = self.flush() {
                debug!(client = %self.info.key(), "could not send close frame: {e}");
            }
        }
        debug!(client = %self.info.key(), "closed with {code}");
        self.finish(CloseReason::Closed(code), ctx);
    }

    /// The peer closed its end (a read returned zero bytes).
    pub fn peer_closed(&mut self, ctx: &mut Dispatch<'_>) {
        if self.is_closed() {
            return;
        }
        let reason = if self.awaiting_more_data() {
            warn!(client = %self.info.key(), "connection closed mid-frame");
            CloseReason::TransportError
        } else {
            info!(client = %self.info.key(), "client disconnected");
            CloseReason::PeerDisconnected
        };
        self.finish(reason, ctx);
    }

    /// Drops a socket that never completed its upgrade request.  No HTTP
    /// response is written.
    pub fn expire_handshake(&mut self, ctx: &mut Dispatch<'_>) {
        if self.state != ConnectionState::AwaitingHandshake {
            return;
        }
        warn!(client = %self.info.key(), "no upgrade request before the handshake deadline");
        self.finish(CloseReason::HandshakeTimeout, ctx);
    }

    /// A read or write on the socket failed.
    pub fn fail(&mut self, err: &io::Error, ctx: &mut Dispatch<'_>) {
        if self.is_closed() {
            return;
        }
        warn!(client = %self.info.key(), "transport error: {err}");
        self.pending_write.clear();
        self.finish(CloseReason::TransportError, ctx);
    }

    fn finish(&mut self, reason: CloseReason, ctx: &mut Dispatch<'_>) {
        self.state = ConnectionState::Closed;
        self.close_reason = Some(reason);
        self.buffer.clear();
        self.notify_disconnect(ctx);
        if let Err(e) = self.transport.shutdown() {
            debug!(client = %self.info.key(), "shutdown: {e}");
        }
    }

    fn notify_disconnect(&mut self, ctx: &mut Dispatch<'_>) {
        let Some(name) = self.application.take() else {
            return;
        };
        if let Err(e) = ctx
            .applications
            .dispatch(&name, Event::Disconnect(&self.info), ctx.outbox)
        {
            report_application_error(&self.info, &name, "disconnect", e, ctx);
        }
        if let Some(status) = ctx.applications.status_mut() {
            status.client_disconnected(self.info.ip(), self.info.port(), ctx.outbox);
        }
    }
}

/// Logs a failed callback.  Panics are also surfaced on the status feed.
fn report_application_error(
    client: &ClientInfo,
    application: &str,
    event: &'static str,
    err: ApplicationError,
    ctx: &mut Dispatch<'_>,
) {
    warn!(client = %client.key(), application, event, "application error: {err}");
    if let ApplicationError::Panicked(_) = err {
        if let Some(status) = ctx.applications.status_mut() {
            let text = format!("Application {application} failed during {event}: {err}");
            status.status_message(&text, StatusLevel::Error, ctx.outbox);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
