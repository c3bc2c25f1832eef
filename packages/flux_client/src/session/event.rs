use std::fmt;

use flux_protocol::{ConnectionConfig, FileTransferPayload};
use serde::Serialize;

/// Connection state of one logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Published by a session whenever something its owner may render changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session_id: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    StateChanged(ConnectionState),
    /// Human-readable status line.
    Status(String),
    ConfigChanged(Option<ConnectionConfig>),
    /// Bytes for the terminal: device output plus locally generated notices.
    Output(Vec<u8>),
    FileTransfer(FileTransferPayload),
}

/// Point-in-time view of a session, as returned by `SessionHandle::snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: ConnectionState,
    pub config: Option<ConnectionConfig>,
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    pub ssh_session: Option<String>,
    pub status: String,
}
