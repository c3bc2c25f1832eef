//! JSON envelope shared by every frame on the gateway WebSocket.
//!
//! Wire format: `{ "type": "...", "session_id": "...", "payload": {...}, "timestamp": <ms> }`
//!
//! The payload is kept as raw JSON in [`WireMessage`] and decoded on demand,
//! so an unknown or malformed payload only fails the frame that carries it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::config::{SerialConfig, SshConfig};
use crate::error::ProtocolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Data,
    Control,
    Status,
    Error,
    FileTransfer,
}

/// One frame on the shared transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Logical session the frame belongs to. Absent on transport-wide frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A decoded payload, one variant per [`MessageKind`].
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Data(DataPayload),
    Control(ControlPayload),
    Status(StatusPayload),
    Error(ErrorPayload),
    FileTransfer(FileTransferPayload),
}

impl WireMessage {
    fn build(kind: MessageKind, session_id: Option<&str>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            session_id: session_id.map(str::to_string),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Terminal input, base64-wrapped.
    pub fn data(session_id: Option<&str>, bytes: &[u8]) -> Self {
        let payload = DataPayload::from_bytes(bytes);
        Self::build(MessageKind::Data, session_id, to_value(&payload))
    }

    pub fn control(session_id: Option<&str>, control: ControlPayload) -> Self {
        Self::build(MessageKind::Control, session_id, to_value(&control))
    }

    pub fn status(session_id: Option<&str>, status: StatusPayload) -> Self {
        Self::build(MessageKind::Status, session_id, to_value(&status))
    }

    pub fn error(session_id: Option<&str>, error: ErrorPayload) -> Self {
        Self::build(MessageKind::Error, session_id, to_value(&error))
    }

    pub fn file_transfer(session_id: Option<&str>, progress: FileTransferPayload) -> Self {
        Self::build(MessageKind::FileTransfer, session_id, to_value(&progress))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode the payload according to `kind`.
    pub fn decode(&self) -> Result<Payload, ProtocolError> {
        let raw = self.payload.clone();
        Ok(match self.kind {
            MessageKind::Data => Payload::Data(serde_json::from_value(raw)?),
            MessageKind::Control => Payload::Control(serde_json::from_value(raw)?),
            MessageKind::Status => Payload::Status(serde_json::from_value(raw)?),
            MessageKind::Error => Payload::Error(serde_json::from_value(raw)?),
            MessageKind::FileTransfer => Payload::FileTransfer(serde_json::from_value(raw)?),
        })
    }
}

// Payload structs only contain strings, numbers and maps, which always serialize.
fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    Raw,
    #[default]
    Base64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    pub data: String,
    #[serde(default)]
    pub encoding: DataEncoding,
}

impl DataPayload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: STANDARD.encode(bytes),
            encoding: DataEncoding::Base64,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        match self.encoding {
            DataEncoding::Base64 => Ok(STANDARD.decode(self.data.as_bytes())?),
            DataEncoding::Raw => Ok(self.data.as_bytes().to_vec()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Connect,
    ConnectSsh,
    AttachSsh,
    Disconnect,
    Resize,
    SendFile,
    ReceiveFile,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl ControlPayload {
    pub fn new(action: ControlAction) -> Self {
        Self {
            action,
            params: None,
        }
    }

    pub fn with_params<T: Serialize>(action: ControlAction, params: &T) -> Self {
        Self {
            action,
            params: Some(to_value(params)),
        }
    }

    pub fn connect(config: &SerialConfig) -> Self {
        Self::with_params(ControlAction::Connect, config)
    }

    pub fn connect_ssh(config: &SshConfig) -> Self {
        Self::with_params(ControlAction::ConnectSsh, config)
    }

    pub fn attach_ssh(remote_session_id: &str) -> Self {
        Self::with_params(
            ControlAction::AttachSsh,
            &serde_json::json!({ "session_id": remote_session_id }),
        )
    }

    pub fn disconnect() -> Self {
        Self::new(ControlAction::Disconnect)
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        Self::with_params(
            ControlAction::Resize,
            &serde_json::json!({ "cols": cols, "rows": rows }),
        )
    }

    /// `data` is the whole file, base64-encoded.
    pub fn send_file(file_name: &str, data: &str, protocol: &str) -> Self {
        Self::with_params(
            ControlAction::SendFile,
            &serde_json::json!({ "file_name": file_name, "data": data, "protocol": protocol }),
        )
    }

    pub fn receive_file(file_name: &str, protocol: &str) -> Self {
        Self::with_params(
            ControlAction::ReceiveFile,
            &serde_json::json!({ "file_name": file_name, "protocol": protocol }),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Connected,
    Disconnected,
    Connecting,
    Error,
    Ready,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: StatusState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusPayload {
    pub fn new(state: StatusState) -> Self {
        Self {
            state,
            message: None,
        }
    }

    pub fn with_message(state: StatusState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileTransferAction {
    Start,
    Progress,
    Complete,
    Error,
}

/// Progress report for an XMODEM-style transfer. The gateway omits zero fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferPayload {
    pub action: FileTransferAction,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
