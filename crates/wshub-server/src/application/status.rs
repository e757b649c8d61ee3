//! Built-in status application.
//!
//! Clients connected to `/status` receive a live feed of server activity:
//! who connects and disconnects, which client just sent a message, and
//! warnings raised by admission control.  Every message is JSON of the form
//! `{"action": "<event>", "data": ...}`:
//!
//! | action               | data                                                  |
//! |----------------------|-------------------------------------------------------|
//! | `serverInfo`         | `{maxClients, maxConnectionsPerIp, clientCount, clients}` |
//! | `clientConnected`    | `{client: "ip:port", clientCount}`                    |
//! | `clientDisconnected` | `{client: "ip:port", clientCount}`                    |
//! | `clientActivity`     | `"ip:port"`                                           |
//! | `statusMsg`          | `{type: "info" \| "warning" \| "error", text}`        |
//!
//! Unlike ordinary applications it also tracks *every* handshaken client on
//! the server, fed by the event loop through the inherent notification
//! methods below.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use serde::Serialize;
use tracing::warn;
use wshub_core::ipc::IpcData;

use crate::application::registry::{Application, ApplicationError, Outbox};
use crate::domain::client::client_key;
use crate::domain::{ClientInfo, ConnectionId};

/// Severity attached to a `statusMsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// One client as listed in `serverInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSummary {
    pub ip: String,
    pub port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfo<'a> {
    max_clients: usize,
    max_connections_per_ip: usize,
    client_count: usize,
    clients: &'a BTreeMap<String, ClientSummary>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientChange<'a> {
    client: &'a str,
    client_count: usize,
}

#[derive(Serialize)]
struct StatusText<'a> {
    #[serde(rename = "type")]
    level: StatusLevel,
    text: &'a str,
}

#[derive(Serialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
enum StatusEvent<'a> {
    ServerInfo(ServerInfo<'a>),
    ClientConnected(ClientChange<'a>),
    ClientDisconnected(ClientChange<'a>),
    ClientActivity(&'a str),
    #[serde(rename = "statusMsg")]
    StatusMessage(StatusText<'a>),
}

/// Diagnostics feed for `/status` subscribers.
#[derive(Debug, Default)]
pub struct StatusApplication {
    subscribers: HashMap<ConnectionId, ClientInfo>,
    clients: BTreeMap<String, ClientSummary>,
    max_clients: usize,
    max_connections_per_ip: usize,
}

impl StatusApplication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the admission limits reported in `serverInfo`.
    pub fn set_server_info(&mut self, max_clients: usize, max_connections_per_ip: usize) {
        self.max_clients = max_clients;
        self.max_connections_per_ip = max_connections_per_ip;
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn max_connections_per_ip(&self) -> usize {
        self.max_connections_per_ip
    }

    /// Number of handshaken clients on the whole server.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of clients watching the status feed.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// A client on any application completed its handshake.
    pub fn client_connected(&mut self, ip: IpAddr, port: u16, outbox: &mut Outbox) {
        let key = client_key(ip, port);
        self.clients.insert(
            key.clone(),
            ClientSummary {
                ip: ip.to_string(),
                port,
            },
        );
        let event = StatusEvent::ClientConnected(ClientChange {
            client: &key,
            client_count: self.clients.len(),
        });
        self.broadcast(&event, outbox);
    }

    /// A client on any application went away.  Unknown clients (rejected
    /// before their handshake) are ignored.
    pub fn client_disconnected(&mut self, ip: IpAddr, port: u16, outbox: &mut Outbox) {
        let key = client_key(ip, port);
        if self.clients.remove(&key).is_none() {
            return;
        }
        let event = StatusEvent::ClientDisconnected(ClientChange {
            client: &key,
            client_count: self.clients.len(),
        });
        self.broadcast(&event, outbox);
    }

    /// A client sent a message.
    pub fn client_activity(&mut self, key: &str, outbox: &mut Outbox) {
        self.broadcast(&StatusEvent::ClientActivity(key), outbox);
    }

    /// Pushes a timestamped text line to every subscriber.
    pub fn status_message(&mut self, text: &str, level: StatusLevel, outbox: &mut Outbox) {
        let stamped = format!("{} {text}", chrono::Local::now().format("[%m-%d %H:%M]"));
        let event = StatusEvent::StatusMessage(StatusText {
            level,
            text: &stamped,
        });
        self.broadcast(&event, outbox);
    }

    /// Re-sends `serverInfo` to every subscriber.
    pub fn broadcast_server_info(&mut self, outbox: &mut Outbox) {
        let event = self.server_info();
        self.broadcast(&event, outbox);
    }

    fn server_info(&self) -> StatusEvent<'_> {
        StatusEvent::ServerInfo(ServerInfo {
            max_clients: self.max_clients,
            max_connections_per_ip: self.max_connections_per_ip,
            client_count: self.clients.len(),
            clients: &self.clients,
        })
    }

    fn broadcast(&self, event: &StatusEvent<'_>, outbox: &mut Outbox) {
        if self.subscribers.is_empty() {
            return;
        }
        match serde_json::to_string(event) {
            Ok(text) => outbox.broadcast(self.subscribers.keys(), &text),
            Err(e) => warn!("failed to encode status event: {e}"),
        }
    }
}

impl Application for StatusApplication {
    fn on_connect(
        &mut self,
        client: &ClientInfo,
        outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        self.subscribers.insert(client.id, *client);
        let text = serde_json::to_string(&self.server_info())?;
        outbox.send(client.id, text);
        Ok(())
    }

    fn on_disconnect(
        &mut self,
        client: &ClientInfo,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        self.subscribers.remove(&client.id);
        Ok(())
    }

    fn on_data(
        &mut self,
        _payload: &str,
        _client: &ClientInfo,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        Ok(())
    }

    fn on_ipc_data(
        &mut self,
        _data: &IpcData,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
