//! In-memory dialer for transport and session tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use flux_protocol::{ControlAction, Payload, StatusPayload, StatusState, WireMessage};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use super::dialer::{Dialer, Link};
use crate::error::TransportError;

/// The gateway side of one mock connection.
pub(crate) struct MockPeer {
    pub sent: mpsc::UnboundedReceiver<String>,
    pub inject: mpsc::UnboundedSender<String>,
}

impl MockPeer {
    pub async fn next_message(&mut self) -> WireMessage {
        let text = self.sent.recv().await.expect("client closed the link");
        WireMessage::from_json(&text).expect("client sent a malformed frame")
    }

    /// Next outbound control frame's action and session id.
    pub async fn next_control(&mut self) -> (ControlAction, Option<String>) {
        let msg = self.next_message().await;
        match msg.decode().expect("undecodable payload") {
            Payload::Control(control) => (control.action, msg.session_id),
            other => panic!("expected control frame, got {:?}", other),
        }
    }

    pub fn push(&self, msg: &WireMessage) {
        self.push_raw(&msg.to_json().unwrap());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.inject.send(text.to_string());
    }

    pub fn push_status(&self, session_id: &str, state: StatusState) {
        self.push(&WireMessage::status(
            Some(session_id),
            StatusPayload::new(state),
        ));
    }

    /// Close the socket from the gateway side.
    pub fn hang_up(self) {}
}

pub(crate) struct MockDialer {
    dials: AtomicUsize,
    fail: AtomicBool,
    held: watch::Sender<bool>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            dials: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            held: watch::channel(false).0,
            peers,
        });
        (dialer, rx)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Park subsequent dials until [`MockDialer::release`].
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }
}

impl Dialer for MockDialer {
    fn dial(&self, _url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.held.subscribe();
        let fail = self.fail.load(Ordering::SeqCst);
        let peers = self.peers.clone();

        Box::pin(async move {
            let _ = gate.wait_for(|held| !*held).await;
            if fail {
                return Err(TransportError::Unavailable);
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let _ = peers.send(MockPeer {
                sent: out_rx,
                inject: in_tx,
            });
            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
