//! FluxTerm client core
//!
//! Connection lifecycle for serial and SSH sessions multiplexed over one
//! gateway WebSocket. There is no terminal or UI code here; the `fluxterm`
//! binary is one front-end built on top.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flux_client::{
//!     ClientConfig, FileConfig, GatewayApi, SessionEventKind, SessionRegistry, TransportClient,
//! };
//! use flux_protocol::SerialConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::from_file(&FileConfig::default());
//!     let transport = TransportClient::new(config.gateway.ws_url.clone());
//!     let api = Arc::new(GatewayApi::new(&config.gateway)?);
//!     let mut registry = SessionRegistry::new(transport, api, config.reconnect);
//!
//!     let mut events = registry.subscribe();
//!     let id = registry.active_session_id().to_string();
//!     registry
//!         .connect(&id, SerialConfig::new("/dev/ttyUSB0").into(), true)
//!         .await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         registry.apply(&event);
//!         if let SessionEventKind::Output(bytes) = &event.kind {
//!             print!("{}", String::from_utf8_lossy(bytes));
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod automation;
pub mod config;
mod error;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;

pub use api::{GatewayApi, PortInfo, SshGateway};
pub use automation::{MacroError, run_macro, run_stored_macro};
pub use config::{ClientConfig, ClientPaths, FileConfig, GatewayConfig, load_config};
pub use error::{ApiError, SessionError, StoreError, TransportError};
pub use registry::{SessionRecord, SessionRegistry, SessionUpdate};
pub use session::{
    ConnectionState, ReconnectPolicy, SessionEvent, SessionEventKind, SessionHandle,
    SessionSnapshot,
};
pub use store::{Macro, MacroStore, MacroUpdate, ProfileStore, SessionProfile};
pub use transport::{TransportClient, TransportEvent, TransportState};
