use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flux_protocol::ConnectionConfig;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::SshGateway;
use crate::error::SessionError;
use crate::session::{
    ConnectionState, ReconnectPolicy, SessionActor, SessionEvent, SessionEventKind,
    SessionHandle, SpawnOptions,
};
use crate::transport::TransportClient;

/// Default depth of the shared event channel.
pub const EVENT_CAPACITY: usize = 1024;

/// What the owner knows about a session, kept current via [`SessionRegistry::apply`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    pub config: Option<ConnectionConfig>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Shallow patch for [`SessionRegistry::update_session`]; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub state: Option<ConnectionState>,
    pub config: Option<Option<ConnectionConfig>>,
    pub status: Option<String>,
}

/// Owns every session of the process and tracks which one is focused.
///
/// Never empty after construction: closing the last session creates a
/// fresh default one. Ids are `session-N` and are never reused.
pub struct SessionRegistry {
    transport: TransportClient,
    ssh: Arc<dyn SshGateway>,
    policy: ReconnectPolicy,
    events: broadcast::Sender<SessionEvent>,
    records: Vec<SessionRecord>,
    handles: HashMap<String, SessionHandle>,
    active: String,
    next_id: u64,
}

impl SessionRegistry {
    /// Must be called inside a tokio runtime; spawns the bootstrap session.
    pub fn new(
        transport: TransportClient,
        ssh: Arc<dyn SshGateway>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::with_event_capacity(transport, ssh, policy, EVENT_CAPACITY)
    }

    /// Subscribers that fall more than `capacity` events behind get
    /// `RecvError::Lagged` and should call [`SessionRegistry::resync`].
    pub fn with_event_capacity(
        transport: TransportClient,
        ssh: Arc<dyn SshGateway>,
        policy: ReconnectPolicy,
        capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let mut registry = Self {
            transport,
            ssh,
            policy,
            events,
            records: Vec::new(),
            handles: HashMap::new(),
            active: String::new(),
            next_id: 0,
        };
        registry.create_session();
        registry
    }

    /// Events from every session in the registry.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn create_session(&mut self) -> SessionRecord {
        let n = self.next_id;
        self.next_id += 1;
        let id = format!("session-{n}");

        let handle = SessionActor::spawn(SpawnOptions {
            id: id.clone(),
            transport: self.transport.clone(),
            ssh: Arc::clone(&self.ssh),
            policy: self.policy,
            events: self.events.clone(),
        });

        let record = SessionRecord {
            id: id.clone(),
            name: format!("Session {}", n + 1),
            state: ConnectionState::Disconnected,
            config: None,
            status: "Disconnected".to_string(),
            created_at: Utc::now(),
        };
        self.records.push(record.clone());
        self.handles.insert(id.clone(), handle);
        self.active = id;
        info!(session = %record.id, "session created");
        record
    }

    /// Remove a session and stop its actor. Returns `false` for unknown ids.
    pub async fn close_session(&mut self, id: &str) -> bool {
        let Some(pos) = self.records.iter().position(|r| r.id == id) else {
            warn!(session = id, "close requested for unknown session");
            return false;
        };
        self.records.remove(pos);
        if let Some(handle) = self.handles.remove(id) {
            if let Err(e) = handle.shutdown().await {
                debug!(session = id, error = %e, "session actor already stopped");
            }
        }
        info!(session = id, "session closed");

        if self.records.is_empty() {
            // create_session focuses the replacement
            self.create_session();
        } else if self.active == id {
            self.active = self.records[0].id.clone();
        }
        true
    }

    pub fn update_session(&mut self, id: &str, update: SessionUpdate) -> bool {
        let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(state) = update.state {
            record.state = state;
        }
        if let Some(config) = update.config {
            record.config = config;
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        true
    }

    pub fn rename_session(&mut self, id: &str, name: impl Into<String>) -> bool {
        self.update_session(
            id,
            SessionUpdate {
                name: Some(name.into()),
                ..Default::default()
            },
        )
    }

    /// Relay a session's event into its record. Output and transfer
    /// progress do not touch the record.
    pub fn apply(&mut self, event: &SessionEvent) -> bool {
        let update = match &event.kind {
            SessionEventKind::StateChanged(state) => SessionUpdate {
                state: Some(*state),
                ..Default::default()
            },
            SessionEventKind::Status(status) => SessionUpdate {
                status: Some(status.clone()),
                ..Default::default()
            },
            SessionEventKind::ConfigChanged(config) => SessionUpdate {
                config: Some(config.clone()),
                ..Default::default()
            },
            SessionEventKind::Output(_) | SessionEventKind::FileTransfer(_) => return false,
        };
        self.update_session(&event.session_id, update)
    }

    /// Refresh every record from its actor's snapshot.
    ///
    /// The event channel drops the oldest events when a subscriber lags,
    /// so `apply` alone can leave a record behind the actor.
    pub async fn resync(&mut self) {
        for record in &mut self.records {
            let Some(handle) = self.handles.get(&record.id) else {
                continue;
            };
            match handle.snapshot().await {
                Ok(snapshot) => {
                    record.state = snapshot.state;
                    record.config = snapshot.config;
                    record.status = snapshot.status;
                }
                Err(e) => debug!(session = %record.id, error = %e, "snapshot unavailable"),
            }
        }
    }

    /// Focus only; no connection is touched. Unknown ids are ignored.
    pub fn set_active_session_id(&mut self, id: &str) -> bool {
        if self.records.iter().any(|r| r.id == id) {
            self.active = id.to_string();
            true
        } else {
            false
        }
    }

    pub fn active_session_id(&self) -> &str {
        &self.active
    }

    pub fn sessions(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn active(&self) -> Option<&SessionRecord> {
        self.get(&self.active)
    }

    pub fn handle(&self, id: &str) -> Option<&SessionHandle> {
        self.handles.get(id)
    }

    pub fn active_handle(&self) -> Option<&SessionHandle> {
        self.handle(&self.active)
    }

    fn require(&self, id: &str) -> Result<&SessionHandle, SessionError> {
        self.handle(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))
    }

    pub async fn connect(
        &self,
        id: &str,
        config: ConnectionConfig,
        auto_reconnect: bool,
    ) -> Result<(), SessionError> {
        self.require(id)?.connect(config, auto_reconnect).await
    }

    pub async fn disconnect(&self, id: &str) -> Result<(), SessionError> {
        self.require(id)?.disconnect().await
    }

    pub async fn send_input(&self, id: &str, bytes: &[u8]) -> Result<(), SessionError> {
        self.require(id)?.send_input(bytes).await
    }

    /// Stop every session actor. Used on process exit.
    pub async fn shutdown(&mut self) {
        for (id, handle) in self.handles.drain() {
            if let Err(e) = handle.shutdown().await {
                debug!(session = %id, error = %e, "session actor already stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::transport::testing::MockDialer;
    use flux_protocol::{ControlAction, SerialConfig, SshConfig, StatusState, WireMessage};
    use futures::future::BoxFuture;

    struct NoSsh;

    impl SshGateway for NoSsh {
        fn open(&self, _config: SshConfig) -> BoxFuture<'static, Result<String, ApiError>> {
            Box::pin(async { Err(ApiError::Unavailable) })
        }

        fn close(&self, _remote_id: String) -> BoxFuture<'static, Result<(), ApiError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn registry() -> (
        SessionRegistry,
        tokio::sync::mpsc::UnboundedReceiver<crate::transport::testing::MockPeer>,
    ) {
        let (dialer, peers) = MockDialer::new();
        let transport = TransportClient::with_dialer("ws://gateway/ws", dialer);
        let registry =
            SessionRegistry::new(transport, Arc::new(NoSsh), ReconnectPolicy::default());
        (registry, peers)
    }

    fn ids(registry: &SessionRegistry) -> Vec<&str> {
        registry.sessions().iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn starts_with_one_default_session() {
        let (registry, _peers) = registry();
        assert_eq!(ids(&registry), vec!["session-0"]);
        let active = registry.active().unwrap();
        assert_eq!(active.id, "session-0");
        assert_eq!(active.name, "Session 1");
        assert_eq!(active.state, ConnectionState::Disconnected);
        assert!(active.config.is_none());
    }

    #[tokio::test]
    async fn create_assigns_next_id_and_focuses_it() {
        let (mut registry, _peers) = registry();
        let record = registry.create_session();
        assert_eq!(record.id, "session-1");
        assert_eq!(record.name, "Session 2");
        assert_eq!(registry.active_session_id(), "session-1");
    }

    #[tokio::test]
    async fn closing_active_focuses_first_remaining() {
        let (mut registry, _peers) = registry();
        registry.create_session();
        registry.create_session();
        registry.set_active_session_id("session-1");

        assert!(registry.close_session("session-1").await);
        assert_eq!(ids(&registry), vec!["session-0", "session-2"]);
        assert_eq!(registry.active_session_id(), "session-0");
        assert!(registry.handle("session-1").is_none());

        // closing an unfocused session keeps focus
        assert!(registry.close_session("session-2").await);
        assert_eq!(registry.active_session_id(), "session-0");
    }

    #[tokio::test]
    async fn closing_active_of_two_focuses_the_other() {
        let (mut registry, _peers) = registry();
        registry.create_session();
        assert_eq!(registry.active_session_id(), "session-1");

        assert!(registry.close_session("session-1").await);
        assert_eq!(registry.sessions().len(), 1);
        assert_eq!(ids(&registry), vec!["session-0"]);
        assert_eq!(registry.active_session_id(), "session-0");
        assert_eq!(registry.active().unwrap().id, "session-0");
    }

    #[tokio::test]
    async fn closing_last_session_creates_replacement() {
        let (mut registry, _peers) = registry();
        registry.create_session();
        registry.close_session("session-0").await;
        registry.close_session("session-1").await;

        assert_eq!(ids(&registry), vec!["session-2"]);
        assert_eq!(registry.active_session_id(), "session-2");
        assert_eq!(registry.active().unwrap().name, "Session 3");
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let (mut registry, _peers) = registry();
        assert!(!registry.close_session("session-9").await);
        assert!(!registry.rename_session("session-9", "x"));
        assert!(!registry.set_active_session_id("session-9"));
        assert_eq!(registry.active_session_id(), "session-0");
        assert!(matches!(
            registry.send_input("session-9", b"x").await,
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn update_merges_shallowly() {
        let (mut registry, _peers) = registry();
        let config: ConnectionConfig = SerialConfig::new("/dev/ttyACM0").into();
        registry.update_session(
            "session-0",
            SessionUpdate {
                state: Some(ConnectionState::Connected),
                config: Some(Some(config.clone())),
                ..Default::default()
            },
        );
        registry.rename_session("session-0", "Router console");

        let record = registry.get("session-0").unwrap();
        assert_eq!(record.name, "Router console");
        assert_eq!(record.state, ConnectionState::Connected);
        assert_eq!(record.config.as_ref(), Some(&config));
        assert_eq!(record.status, "Disconnected");
    }

    #[tokio::test]
    async fn session_events_flow_into_records() {
        let (mut registry, mut peers) = registry();
        let mut events = registry.subscribe();

        registry
            .connect("session-0", SerialConfig::new("/dev/ttyUSB0").into(), false)
            .await
            .unwrap();
        let mut peer = peers.recv().await.unwrap();
        let (action, session) = peer.next_control().await;
        assert_eq!(action, ControlAction::Connect);
        assert_eq!(session.as_deref(), Some("session-0"));

        peer.push_status("session-0", StatusState::Connected);
        loop {
            let event = events.recv().await.unwrap();
            registry.apply(&event);
            // the status line follows the state change
            if event.kind == SessionEventKind::Status("connected".to_string()) {
                break;
            }
        }

        let record = registry.get("session-0").unwrap();
        assert_eq!(record.state, ConnectionState::Connected);
        assert!(record.config.is_some());
        assert_eq!(record.status, "connected");
    }

    #[tokio::test]
    async fn lagging_subscriber_recovers_state_via_resync() {
        let (dialer, mut peers) = MockDialer::new();
        let transport = TransportClient::with_dialer("ws://gateway/ws", dialer);
        let mut registry = SessionRegistry::with_event_capacity(
            transport,
            Arc::new(NoSsh),
            ReconnectPolicy::default(),
            4,
        );
        let mut events = registry.subscribe();

        registry
            .connect("session-0", SerialConfig::new("/dev/ttyUSB0").into(), false)
            .await
            .unwrap();
        let mut peer = peers.recv().await.unwrap();
        peer.next_control().await;

        // the state change is buried under more output than the channel holds
        peer.push_status("session-0", StatusState::Connected);
        for i in 0..32 {
            peer.push(&WireMessage::data(Some("session-0"), format!("line {i}\r\n").as_bytes()));
        }
        peer.push(&WireMessage::data(Some("session-0"), b"end"));

        let handle = registry.handle("session-0").unwrap().clone();
        while handle.snapshot().await.unwrap().state != ConnectionState::Connected {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut lagged = false;
        loop {
            match events.recv().await {
                Ok(event) => {
                    registry.apply(&event);
                    if event.kind == SessionEventKind::Output(b"end".to_vec()) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    lagged = true;
                    registry.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
        assert!(lagged);

        let record = registry.get("session-0").unwrap();
        assert_eq!(record.state, ConnectionState::Connected);
        assert_eq!(record.status, "connected");
        assert!(record.config.is_some());
    }
}
