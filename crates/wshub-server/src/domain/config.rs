//! Server configuration types.
//!
//! [`ServerConfig`] is the single source of truth for all runtime settings.
//! It is deserialised from TOML by the storage layer, then adjusted by
//! command-line overrides in the binary.  Every field has a serde default,
//! so an empty file (or no file at all) yields a working local server.
//!
//! ```toml
//! log_level = "info"
//! status_refresh_secs = 30
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//!
//! [ipc]
//! enabled = true
//! socket_path = "/tmp/wshub.sock"
//! mode = 0o660
//!
//! [limits]
//! max_clients = 30
//! max_connections_per_ip = 5
//! max_requests_per_minute = 2000
//!
//! [origin]
//! check_origin = true
//! allowed_origins = ["example.com"]
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wshub_core::protocol::handshake::HandshakePolicy;

/// A configuration value that would make the server unusable.
#[derive(Debug, Error, PartialEq)]
pub enum InvalidConfig {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between `serverInfo` refreshes to status subscribers.
    /// `0` disables the refresh timer.
    #[serde(default = "default_status_refresh_secs")]
    pub status_refresh_secs: u64,
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub origin: OriginConfig,
}

/// Listening socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// Host name or IP address to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Local IPC datagram socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcConfig {
    /// When false no IPC socket is opened.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Filesystem path of the unix datagram socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Numeric uid to own the socket file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<u32>,
    /// Numeric gid to own the socket file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
    /// Permission bits for the socket file, e.g. `0o660`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    /// Loopback UDP port used where unix sockets are unavailable.
    #[serde(default = "default_loopback_port")]
    pub loopback_port: u16,
}

/// Admission and resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum number of concurrently open connections.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Maximum number of concurrently open connections from one IP.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    /// Per-connection message ceiling per minute.  `None` disables the limiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_minute: Option<u32>,
    /// Largest accepted frame payload; larger frames close with 1004.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u64,
    /// Largest accepted handshake request head; larger requests get a 400.
    #[serde(default = "default_max_handshake_size")]
    pub max_handshake_size: usize,
    /// Milliseconds an accepted socket may take to complete its upgrade
    /// request before it is dropped.  `0` waits forever.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// Origin allow-list settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OriginConfig {
    #[serde(default)]
    pub check_origin: bool,
    /// Accepted origins.  Scheme, `www.` and path are ignored when comparing.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_status_refresh_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/wshub.sock")
}
fn default_loopback_port() -> u16 {
    9000
}
fn default_max_clients() -> usize {
    30
}
fn default_max_connections_per_ip() -> usize {
    5
}
fn default_max_frame_size() -> u64 {
    16 * 1024 * 1024
}
fn default_max_handshake_size() -> usize {
    8 * 1024
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            status_refresh_secs: default_status_refresh_secs(),
            server: ListenConfig::default(),
            ipc: IpcConfig::default(),
            limits: LimitsConfig::default(),
            origin: OriginConfig::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: default_socket_path(),
            owner: None,
            group: None,
            mode: None,
            loopback_port: default_loopback_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_requests_per_minute: None,
            max_frame_size: default_max_frame_size(),
            max_handshake_size: default_max_handshake_size(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// Rejects limits of zero, which would refuse every connection.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidConfig::Zero`] naming the offending field.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.limits.max_clients == 0 {
            return Err(InvalidConfig::Zero("limits.max_clients"));
        }
        if self.limits.max_connections_per_ip == 0 {
            return Err(InvalidConfig::Zero("limits.max_connections_per_ip"));
        }
        if self.limits.max_requests_per_minute == Some(0) {
            return Err(InvalidConfig::Zero("limits.max_requests_per_minute"));
        }
        if self.limits.max_handshake_size == 0 {
            return Err(InvalidConfig::Zero("limits.max_handshake_size"));
        }
        Ok(())
    }

    /// Builds the handshake policy from the origin settings.
    pub fn handshake_policy(&self) -> HandshakePolicy {
        HandshakePolicy::new(self.origin.check_origin, &self.origin.allowed_origins)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
