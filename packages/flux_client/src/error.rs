use std::path::PathBuf;

use flux_protocol::ValidationError;

use crate::session::ConnectionState;

/// Failures of the shared gateway socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("gateway is unavailable")]
    Unavailable,

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("transport is not open")]
    NotOpen,

    #[error("connect attempt was cancelled")]
    Aborted,

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl TransportError {
    pub fn from_tungstenite(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite;

        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Handshake(err.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: ConnectionState,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("session is not connected")]
    NotConnected,

    #[error("file transfer is only available on serial sessions")]
    NotSerial,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session actor is gone")]
    ActorGone,

    #[error("no session with id {0}")]
    UnknownSession(String),
}

/// Failures talking to the gateway's REST API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("gateway is unavailable")]
    Unavailable,

    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),

    #[error("gateway returned {status}: {message}")]
    Status {
        status: reqwest::StatusCode,
        message: String,
    },

    /// The request went through but the gateway reported `success: false`.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Http(reqwest::Error),
}

impl ApiError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Http(err)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store {path} is corrupt: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no entry with id {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_maps_to_unavailable() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = TransportError::from_tungstenite(io.into());
        assert_eq!(err, TransportError::Unavailable);
    }

    #[test]
    fn other_tungstenite_errors_are_handshake_failures() {
        let err =
            TransportError::from_tungstenite(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, TransportError::Handshake(_)));
    }

    #[test]
    fn invalid_transition_reads_naturally() {
        let err = SessionError::InvalidTransition {
            action: "connect",
            state: ConnectionState::Connected,
        };
        assert_eq!(err.to_string(), "cannot connect while connected");
    }
}
