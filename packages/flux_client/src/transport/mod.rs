//! The single WebSocket to the gateway, shared by every session.

mod client;
mod dialer;
#[cfg(test)]
pub(crate) mod testing;

pub use client::{Subscription, TransportClient, TransportEvent, TransportState};
pub use dialer::{Dialer, Link, WsDialer};
