//! Demo echo application.
//!
//! Every client bound to `/echo` can send
//! `{"action": "echo", "data": "<text>"}`; the text is broadcast back to all
//! clients of the application in the same shape.  A local process can inject
//! a line through IPC with the same payload, which is broadcast prefixed by
//! `System Message: `.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use wshub_core::ipc::IpcData;

use crate::application::registry::{Application, ApplicationError, Outbox};
use crate::domain::{ClientInfo, ConnectionId};

/// Requests understood by the echo application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum EchoMessage {
    Echo(String),
}

/// Broadcasts every echo request to all connected clients.
#[derive(Debug, Default)]
pub struct EchoApplication {
    clients: BTreeMap<ConnectionId, ClientInfo>,
}

impl EchoApplication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn broadcast(
        &self,
        message: &EchoMessage,
        outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        let text = serde_json::to_string(message)?;
        outbox.broadcast(self.clients.keys(), &text);
        Ok(())
    }
}

impl Application for EchoApplication {
    fn on_connect(
        &mut self,
        client: &ClientInfo,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        self.clients.insert(client.id, *client);
        Ok(())
    }

    fn on_disconnect(
        &mut self,
        client: &ClientInfo,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        self.clients.remove(&client.id);
        Ok(())
    }

    fn on_data(
        &mut self,
        payload: &str,
        client: &ClientInfo,
        outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        let EchoMessage::Echo(text) = serde_json::from_str::<EchoMessage>(payload)?;
        debug!(client = %client.key(), "echo of {} bytes", text.len());
        self.broadcast(&EchoMessage::Echo(text), outbox)
    }

    fn on_ipc_data(
        &mut self,
        data: &IpcData,
        outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        let EchoMessage::Echo(text) =
            serde_json::from_value::<EchoMessage>(Value::Object(data.clone()))?;
        self.broadcast(&EchoMessage::Echo(format!("System Message: {text}")), outbox)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
