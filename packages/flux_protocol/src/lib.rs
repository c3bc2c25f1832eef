//! FluxTerm gateway protocol
//!
//! Message types carried over the gateway WebSocket and the connection
//! configurations that travel inside them. This crate has no I/O; the
//! transport and session state machines live in `flux_client`.
//!
//! # Example
//!
//! ```
//! use flux_protocol::{Payload, WireMessage};
//!
//! let msg = WireMessage::data(Some("session-0"), b"hello\r\n");
//! let json = msg.to_json().unwrap();
//!
//! let back = WireMessage::from_json(&json).unwrap();
//! match back.decode().unwrap() {
//!     Payload::Data(data) => assert_eq!(data.to_bytes().unwrap(), b"hello\r\n"),
//!     other => panic!("unexpected payload: {:?}", other),
//! }
//! ```

pub mod config;
mod error;
pub mod message;

pub use config::{
    AuthMethod, ConnectionConfig, ConnectionKind, FlowControl, Parity, SerialConfig, SshConfig,
    StopBits,
};
pub use error::{ProtocolError, ValidationError};
pub use message::{
    ControlAction, ControlPayload, DataEncoding, DataPayload, ErrorPayload, FileTransferAction,
    FileTransferPayload, MessageKind, Payload, StatusPayload, StatusState, WireMessage,
};
