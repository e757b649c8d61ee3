//! Admission control: connection caps and the per-connection request limiter.
//!
//! # Why admission control? (for beginners)
//!
//! Every open socket costs a file descriptor and some memory.  Without limits
//! a single misbehaving host could open thousands of connections and starve
//! everyone else.  Two caps are checked on every accept:
//!
//! - a global cap on open connections (`max_clients`), and
//! - a per-IP cap (`max_connections_per_ip`).
//!
//! A rejected socket is dropped before the handshake.  Counters are
//! incremented only for admitted sockets and decremented exactly once when
//! the server removes the connection, so they never drift.
//!
//! The optional [`RequestRateLimiter`] additionally caps how many frames a
//! single connection may send per minute.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::domain::ConnectionId;

/// Length of one rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Why an accepted socket was refused.
#[derive(Debug, Error, PartialEq)]
pub enum AdmissionError {
    #[error("client limit of {limit} reached")]
    ClientLimit { limit: usize },

    #[error("connection limit of {limit} reached for {ip}")]
    IpLimit { ip: IpAddr, limit: usize },
}

impl AdmissionError {
    /// Warning text pushed to the status application.
    pub fn status_text(&self) -> String {
        match self {
            AdmissionError::ClientLimit { .. } => "Attention: Client Limit Reached!".to_string(),
            AdmissionError::IpLimit { ip, .. } => {
                format!("Connection/Ip limit for ip {ip} was reached!")
            }
        }
    }
}

/// Tracks open connections globally and per peer IP.
#[derive(Debug)]
pub struct AdmissionControl {
    max_clients: usize,
    max_connections_per_ip: usize,
    open: usize,
    per_ip: HashMap<IpAddr, usize>,
}

impl AdmissionControl {
    pub fn new(max_clients: usize, max_connections_per_ip: usize) -> Self {
        Self {
            max_clients,
            max_connections_per_ip,
            open: 0,
            per_ip: HashMap::new(),
        }
    }

    /// Counts a new connection from `ip`, or refuses it.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] when either cap would be exceeded.  Nothing
    /// is counted in that case.
    pub fn try_admit(&mut self, ip: IpAddr) -> Result<(), AdmissionError> {
        if self.open >= self.max_clients {
            return Err(AdmissionError::ClientLimit {
                limit: self.max_clients,
            });
        }
        let from_ip = self.per_ip.get(&ip).copied().unwrap_or(0);
        if from_ip >= self.max_connections_per_ip {
            return Err(AdmissionError::IpLimit {
                ip,
                limit: self.max_connections_per_ip,
            });
        }
        self.per_ip.insert(ip, from_ip + 1);
        self.open += 1;
        Ok(())
    }

    /// Releases one admitted connection from `ip`.
    ///
    /// Returns `false` (and changes nothing) when `ip` has no open
    /// connections, so a stray second release cannot drive counts negative.
    pub fn release(&mut self, ip: IpAddr) -> bool {
        match self.per_ip.get_mut(&ip) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.per_ip.remove(&ip);
                }
                self.open = self.open.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    pub fn open_connections(&self) -> usize {
        self.open
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).copied().unwrap_or(0)
    }
}

// ── Request limiter ───────────────────────────────────────────────────────────

/// A connection sent more frames than allowed in the current window.
#[derive(Debug, Error, PartialEq)]
#[error("request limit of {limit} per minute exceeded")]
pub struct RateLimitExceeded {
    pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter keyed by connection.
///
/// A window opens at a connection's first request and lasts
/// [`RATE_WINDOW`]; the first request after it expires opens a new one.
#[derive(Debug)]
pub struct RequestRateLimiter {
    max_per_minute: u32,
    windows: HashMap<ConnectionId, Window>,
}

impl RequestRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            windows: HashMap::new(),
        }
    }

    /// Counts one request from `id` at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] once the count within the current window
    /// exceeds the ceiling.
    pub fn check(&mut self, id: ConnectionId, now: Instant) -> Result<(), RateLimitExceeded> {
        let window = self.windows.entry(id).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(window.started) > RATE_WINDOW {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        window.count = window.count.saturating_add(1);
        if window.count > self.max_per_minute {
            return Err(RateLimitExceeded {
                limit: self.max_per_minute,
            });
        }
        Ok(())
    }

    /// Drops the window of a removed connection.
    pub fn forget(&mut self, id: ConnectionId) {
        self.windows.remove(&id);
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
