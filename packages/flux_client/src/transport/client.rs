use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use flux_protocol::{ControlPayload, SerialConfig, SshConfig, WireMessage};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dialer::{Dialer, WsDialer};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Connecting,
    Open,
}

/// Lifecycle notifications for observers of the shared socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    /// The socket ended without a call to [`TransportClient::disconnect`].
    Dropped,
    /// Closed by [`TransportClient::disconnect`].
    Closed,
}

type Handler = Arc<dyn Fn(&WireMessage) + Send + Sync>;
type PendingConnect = Shared<BoxFuture<'static, Result<(), TransportError>>>;

enum Conn {
    Closed,
    Connecting {
        generation: u64,
        pending: PendingConnect,
        dial: AbortHandle,
    },
    Open {
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    },
}

impl Conn {
    fn state(&self) -> TransportState {
        match self {
            Conn::Closed => TransportState::Closed,
            Conn::Connecting { .. } => TransportState::Connecting,
            Conn::Open { .. } => TransportState::Open,
        }
    }

    fn is_generation(&self, expected: u64) -> bool {
        match self {
            Conn::Connecting { generation, .. } | Conn::Open { generation, .. } => {
                *generation == expected
            }
            Conn::Closed => false,
        }
    }
}

struct Inner {
    url: String,
    dialer: Arc<dyn Dialer>,
    conn: Mutex<Conn>,
    generation: AtomicU64,
    next_subscription: AtomicU64,
    subscribers: Mutex<BTreeMap<u64, Handler>>,
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<WireMessage>>>,
    state_tx: watch::Sender<TransportState>,
    events: broadcast::Sender<TransportEvent>,
}

// No lock here is held across user code, so a poisoned guard still holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Multiplexes every session over one gateway WebSocket.
///
/// Cheap to clone; all clones share the same socket, subscribers and routes.
/// Inbound frames are handed to every subscriber in registration order and,
/// when they carry a `session_id`, to that session's routed inbox.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_dialer(url, Arc::new(WsDialer))
    }

    pub fn with_dialer(url: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        let (state_tx, _) = watch::channel(TransportState::Closed);
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                dialer,
                conn: Mutex::new(Conn::Closed),
                generation: AtomicU64::new(0),
                next_subscription: AtomicU64::new(0),
                subscribers: Mutex::new(BTreeMap::new()),
                routes: Mutex::new(HashMap::new()),
                state_tx,
                events,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> TransportState {
        lock(&self.inner.conn).state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.inner.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Open the socket, or join the attempt already in flight.
    ///
    /// Resolves immediately when already open. Concurrent callers share one
    /// dial and observe the same result.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let pending = {
            let mut conn = lock(&self.inner.conn);
            match &*conn {
                Conn::Open { .. } => return Ok(()),
                Conn::Connecting { pending, .. } => pending.clone(),
                Conn::Closed => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let task = tokio::spawn(Arc::clone(&self.inner).establish(generation));
                    let dial = task.abort_handle();
                    let pending = async move { task.await.unwrap_or(Err(TransportError::Aborted)) }
                        .boxed()
                        .shared();
                    *conn = Conn::Connecting {
                        generation,
                        pending: pending.clone(),
                        dial,
                    };
                    self.inner.state_tx.send_replace(TransportState::Connecting);
                    debug!(url = %self.inner.url, generation, "dialing gateway");
                    pending
                }
            }
        };
        pending.await
    }

    /// Tear the socket down. Later sends fail until [`connect`](Self::connect)
    /// is called again; an in-flight dial resolves with
    /// [`TransportError::Aborted`].
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.conn), Conn::Closed);
        match previous {
            Conn::Closed => return,
            Conn::Connecting { dial, .. } => dial.abort(),
            Conn::Open { cancel, .. } => cancel.cancel(),
        }
        self.inner.state_tx.send_replace(TransportState::Closed);
        let _ = self.inner.events.send(TransportEvent::Closed);
        info!(url = %self.inner.url, "gateway transport closed");
    }

    /// Register a handler for every inbound frame. Dropping the returned
    /// [`Subscription`] unregisters it.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&WireMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).insert(id, Arc::new(handler));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Inbox for frames addressed to `session_id`. Replaces any earlier route.
    pub fn route(&self, session_id: &str) -> mpsc::UnboundedReceiver<WireMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if lock(&self.inner.routes)
            .insert(session_id.to_string(), tx)
            .is_some()
        {
            debug!(session = session_id, "replaced existing session route");
        }
        rx
    }

    pub fn unroute(&self, session_id: &str) {
        lock(&self.inner.routes).remove(session_id);
    }

    /// Serialize and write one frame. Never panics; a closed transport is
    /// logged and reported as [`TransportError::NotOpen`].
    pub fn send(&self, message: &WireMessage) -> Result<(), TransportError> {
        let text = message
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        let conn = lock(&self.inner.conn);
        let Conn::Open { outbound, .. } = &*conn else {
            warn!(
                kind = ?message.kind,
                session = ?message.session_id,
                "transport not open, message not sent"
            );
            return Err(TransportError::NotOpen);
        };
        outbound.send(text).map_err(|_| {
            warn!(kind = ?message.kind, "gateway writer is gone, message not sent");
            TransportError::NotOpen
        })
    }

    pub fn send_data(&self, session_id: &str, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(&WireMessage::data(Some(session_id), bytes))
    }

    fn send_control(&self, session_id: &str, control: ControlPayload) -> Result<(), TransportError> {
        self.send(&WireMessage::control(Some(session_id), control))
    }

    pub fn open_serial(&self, session_id: &str, config: &SerialConfig) -> Result<(), TransportError> {
        self.send_control(session_id, ControlPayload::connect(config))
    }

    pub fn open_ssh(&self, session_id: &str, config: &SshConfig) -> Result<(), TransportError> {
        self.send_control(session_id, ControlPayload::connect_ssh(config))
    }

    pub fn attach_ssh(&self, session_id: &str, remote_id: &str) -> Result<(), TransportError> {
        self.send_control(session_id, ControlPayload::attach_ssh(remote_id))
    }

    pub fn close_port(&self, session_id: &str) -> Result<(), TransportError> {
        self.send_control(session_id, ControlPayload::disconnect())
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), TransportError> {
        self.send_control(session_id, ControlPayload::resize(cols, rows))
    }

    /// `data` is the whole file, base64-encoded.
    pub fn send_file(
        &self,
        session_id: &str,
        file_name: &str,
        data: &str,
        protocol: &str,
    ) -> Result<(), TransportError> {
        self.send_control(session_id, ControlPayload::send_file(file_name, data, protocol))
    }

    pub fn receive_file(
        &self,
        session_id: &str,
        file_name: &str,
        protocol: &str,
    ) -> Result<(), TransportError> {
        self.send_control(session_id, ControlPayload::receive_file(file_name, protocol))
    }
}

impl Inner {
    async fn establish(self: Arc<Self>, generation: u64) -> Result<(), TransportError> {
        let dialed = self.dialer.dial(&self.url).await;

        let link = {
            let mut conn = lock(&self.conn);
            if !conn.is_generation(generation) {
                return Err(TransportError::Aborted);
            }
            match dialed {
                Ok(link) => {
                    let cancel = CancellationToken::new();
                    *conn = Conn::Open {
                        generation,
                        outbound: link.outbound,
                        cancel: cancel.clone(),
                    };
                    (link.inbound, cancel)
                }
                Err(e) => {
                    *conn = Conn::Closed;
                    self.state_tx.send_replace(TransportState::Closed);
                    warn!(url = %self.url, error = %e, "gateway connect failed");
                    return Err(e);
                }
            }
        };

        self.state_tx.send_replace(TransportState::Open);
        let _ = self.events.send(TransportEvent::Open);
        info!(url = %self.url, "gateway transport open");

        let (inbound, cancel) = link;
        tokio::spawn(Arc::clone(&self).dispatch(generation, inbound, cancel));
        Ok(())
    }

    async fn dispatch(
        self: Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        loop {
            let text = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = inbound.recv() => match frame {
                    Some(text) => text,
                    None => break,
                },
            };
            self.deliver(&text);
        }

        let dropped = {
            let mut conn = lock(&self.conn);
            if matches!(&*conn, Conn::Open { .. }) && conn.is_generation(generation) {
                *conn = Conn::Closed;
                true
            } else {
                false
            }
        };
        if dropped {
            self.state_tx.send_replace(TransportState::Closed);
            let _ = self.events.send(TransportEvent::Dropped);
            warn!(url = %self.url, "gateway transport dropped");
        }
    }

    fn deliver(&self, text: &str) {
        let message = match WireMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding malformed gateway frame");
                return;
            }
        };

        let handlers: Vec<Handler> = lock(&self.subscribers).values().cloned().collect();
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                error!(kind = ?message.kind, "message subscriber panicked");
            }
        }

        let Some(session_id) = message.session_id.clone() else {
            return;
        };
        let route = lock(&self.routes).get(&session_id).cloned();
        match route {
            Some(inbox) => {
                if inbox.send(message).is_err() {
                    debug!(session = %session_id, "session inbox closed");
                }
            }
            None => debug!(session = %session_id, "no route for session"),
        }
    }
}

/// Registration returned by [`TransportClient::subscribe`].
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.subscribers).remove(&self.id);
        }
    }
}
