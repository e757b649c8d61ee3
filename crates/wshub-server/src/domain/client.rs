//! Connection identity.
//!
//! Applications never hold a connection.  They receive a [`ClientInfo`] and
//! address replies by its [`ConnectionId`] through the outbox, so the server
//! remains the only owner of every socket.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use uuid::Uuid;

/// Opaque, stable identifier for one accepted connection.
///
/// Derived (UUID v5) from the peer address and a per-server serial number,
/// so a reconnect from the same `ip:port` still gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn derive(addr: SocketAddr, serial: u64) -> Self {
        let name = format!("{}:{}#{serial}", addr.ip(), addr.port());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What an application knows about a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
}

impl ClientInfo {
    pub fn new(id: ConnectionId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `"ip:port"` key used by the status application.
    pub fn key(&self) -> String {
        client_key(self.ip(), self.port())
    }
}

/// Formats the `"ip:port"` key for a peer.
pub fn client_key(ip: IpAddr, port: u16) -> String {
    format!("{ip}:{port}")
}
