//! JSON envelope exchanged over the local IPC datagram channel.
//!
//! Wire format (one datagram, at most [`MAX_DATAGRAM_SIZE`] bytes):
//! ```text
//! {"type": 1, "action": "<command>",     "data": {...}}   server command
//! {"type": 2, "action": "<application>", "data": {...}}   application payload
//! ```
//!
//! Producers written in loosely typed languages often encode an empty map as
//! `[]` or omit `data` entirely; both decode to an empty [`IpcData`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Largest datagram read from the IPC socket.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Discriminator for a server command envelope.
pub const KIND_SERVER_COMMAND: i64 = 1;

/// Discriminator for an application payload envelope.
pub const KIND_APPLICATION_DATA: i64 = 2;

/// Key/value payload handed to applications.
pub type IpcData = serde_json::Map<String, Value>;

/// Errors that can occur while decoding or encoding an envelope.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The datagram is not valid JSON or does not have the envelope shape.
    #[error("malformed IPC envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// The `type` field is neither 1 nor 2.
    #[error("unknown IPC envelope type: {0}")]
    UnknownKind(i64),

    /// The encoded envelope does not fit in one datagram.
    #[error("IPC envelope of {size} bytes exceeds the 65536-byte datagram limit")]
    TooLarge { size: usize },
}

/// A decoded IPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
    /// A command addressed to the server itself.
    ServerCommand { command: String, data: IpcData },
    /// A payload routed to the named application's IPC handler.
    ApplicationData { application: String, data: IpcData },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: i64,
    action: String,
    #[serde(default, deserialize_with = "lenient_map")]
    data: IpcData,
}

/// Accepts an object, an empty array, or null as the `data` field.
fn lenient_map<'de, D>(deserializer: D) -> Result<IpcData, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(IpcData::new()),
        Value::Array(items) if items.is_empty() => Ok(IpcData::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected an object for `data`, got {other}"
        ))),
    }
}

impl IpcMessage {
    /// Builds an application payload message.
    pub fn application_data(application: impl Into<String>, data: IpcData) -> Self {
        IpcMessage::ApplicationData {
            application: application.into(),
            data,
        }
    }

    /// Decodes one datagram.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::TooLarge`] for oversized input, [`IpcError::Json`]
    /// for malformed JSON and [`IpcError::UnknownKind`] for an unrecognised
    /// `type` value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use wshub_core::ipc::IpcMessage;
    ///
    /// let msg = IpcMessage::decode(br#"{"type":2,"action":"echo","data":[]}"#).unwrap();
    /// assert!(matches!(msg, IpcMessage::ApplicationData { ref application, .. } if application == "echo"));
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, IpcError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(IpcError::TooLarge { size: bytes.len() });
        }
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        match envelope.kind {
            KIND_SERVER_COMMAND => Ok(IpcMessage::ServerCommand {
                command: envelope.action,
                data: envelope.data,
            }),
            KIND_APPLICATION_DATA => Ok(IpcMessage::ApplicationData {
                application: envelope.action,
                data: envelope.data,
            }),
            other => Err(IpcError::UnknownKind(other)),
        }
    }

    /// Encodes this message as a datagram payload.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::TooLarge`] when the JSON exceeds one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        let envelope = match self {
            IpcMessage::ServerCommand { command, data } => Envelope {
                kind: KIND_SERVER_COMMAND,
                action: command.clone(),
                data: data.clone(),
            },
            IpcMessage::ApplicationData { application, data } => Envelope {
                kind: KIND_APPLICATION_DATA,
                action: application.clone(),
                data: data.clone(),
            },
        };
        let bytes = serde_json::to_vec(&envelope)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(IpcError::TooLarge { size: bytes.len() });
        }
        Ok(bytes)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
