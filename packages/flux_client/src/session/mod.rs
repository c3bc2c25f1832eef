//! Per-session connection lifecycle.
//!
//! [`SessionMachine`] holds the transition rules; [`SessionActor`] runs one
//! machine per session on its own task and performs the effects it asks for.

mod actor;
mod event;
mod machine;

pub use actor::{SessionActor, SessionHandle, SpawnOptions};
pub use event::{ConnectionState, SessionEvent, SessionEventKind, SessionSnapshot};
pub use machine::{Effect, ReconnectPolicy, SessionMachine};
