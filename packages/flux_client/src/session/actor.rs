use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flux_protocol::{ConnectionConfig, SerialConfig, WireMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use super::event::{SessionEvent, SessionEventKind, SessionSnapshot};
use super::machine::{Effect, ReconnectPolicy, SessionMachine};
use crate::api::SshGateway;
use crate::error::{SessionError, TransportError};
use crate::transport::{TransportClient, TransportEvent};

/// Commands that can be sent to a session actor
#[derive(Debug)]
enum SessionCommand {
    Connect {
        config: ConnectionConfig,
        auto_reconnect: bool,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    SendInput {
        bytes: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Resize {
        cols: u16,
        rows: u16,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    /// `data` is already base64-encoded.
    SendFile {
        file_name: String,
        data: String,
        size: usize,
        protocol: String,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    ReceiveFile {
        file_name: String,
        protocol: String,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Locally generated terminal output, e.g. macro echo.
    Echo {
        bytes: Vec<u8>,
        respond_to: oneshot::Sender<()>,
    },
    SetStatus {
        status: String,
        respond_to: oneshot::Sender<()>,
    },
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Results of work the actor spawned off its loop.
enum Completion {
    TransportReady(Result<(), TransportError>),
    SshOpened {
        attempt: u64,
        result: Result<String, String>,
    },
    SshClosed(Result<(), String>),
}

/// What the actor is waiting on the transport for.
#[derive(Debug)]
enum PendingOpen {
    Serial(SerialConfig),
    Attach(String),
}

/// Handle to communicate with a session actor
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    sender: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Events published by this session (and any other sessions sharing the bus).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| SessionError::ActorGone)?;
        rx.await.map_err(|_| SessionError::ActorGone)
    }

    /// Validate and start a connection. Returns once the session is
    /// `Connecting`; the outcome arrives as [`SessionEvent`]s.
    pub async fn connect(
        &self,
        config: ConnectionConfig,
        auto_reconnect: bool,
    ) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Connect {
            config,
            auto_reconnect,
            respond_to,
        })
        .await?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Disconnect { respond_to })
            .await?
    }

    pub async fn send_input(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let bytes = bytes.to_vec();
        self.request(|respond_to| SessionCommand::SendInput { bytes, respond_to })
            .await?
    }

    /// Forwarded only while connected; otherwise a no-op.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Resize {
            cols,
            rows,
            respond_to,
        })
        .await?
    }

    /// Read a local file and ask the gateway to push it over the serial line.
    pub async fn send_file(&self, path: &Path, protocol: &str) -> Result<(), SessionError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| SessionError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let size = bytes.len();
        let data = STANDARD.encode(&bytes);
        let protocol = protocol.to_string();
        self.request(|respond_to| SessionCommand::SendFile {
            file_name,
            data,
            size,
            protocol,
            respond_to,
        })
        .await?
    }

    pub async fn receive_file(&self, file_name: &str, protocol: &str) -> Result<(), SessionError> {
        let file_name = file_name.to_string();
        let protocol = protocol.to_string();
        self.request(|respond_to| SessionCommand::ReceiveFile {
            file_name,
            protocol,
            respond_to,
        })
        .await?
    }

    pub async fn echo(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let bytes = bytes.to_vec();
        self.request(|respond_to| SessionCommand::Echo { bytes, respond_to })
            .await
    }

    pub async fn set_status(&self, status: impl Into<String>) -> Result<(), SessionError> {
        let status = status.into();
        self.request(|respond_to| SessionCommand::SetStatus { status, respond_to })
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|respond_to| SessionCommand::Snapshot { respond_to })
            .await
    }

    /// Close any open connection and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Shutdown { respond_to })
            .await
    }
}

/// Options for spawning a session actor
pub struct SpawnOptions {
    pub id: String,
    pub transport: TransportClient,
    pub ssh: Arc<dyn SshGateway>,
    pub policy: ReconnectPolicy,
    pub events: broadcast::Sender<SessionEvent>,
}

/// The actor that drives one session's connection lifecycle
pub struct SessionActor {
    id: String,
    machine: SessionMachine,
    transport: TransportClient,
    ssh: Arc<dyn SshGateway>,
    events: broadcast::Sender<SessionEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    pending: Option<PendingOpen>,
    reconnect: Pin<Box<Sleep>>,
    reconnect_armed: bool,
}

enum Step {
    Command(Option<SessionCommand>),
    Inbound(WireMessage),
    Transport(Result<TransportEvent, broadcast::error::RecvError>),
    Completed(Completion),
    ReconnectDue,
}

impl SessionActor {
    /// Spawn a new session actor and return its handle
    pub fn spawn(opts: SpawnOptions) -> SessionHandle {
        let (sender, receiver) = mpsc::channel(32);
        let (completions, completion_rx) = mpsc::unbounded_channel();

        let inbox = opts.transport.route(&opts.id);
        let transport_events = opts.transport.events();

        let actor = SessionActor {
            id: opts.id.clone(),
            machine: SessionMachine::new(opts.id.clone(), opts.policy),
            transport: opts.transport,
            ssh: opts.ssh,
            events: opts.events.clone(),
            completions,
            pending: None,
            reconnect: Box::pin(tokio::time::sleep(std::time::Duration::ZERO)),
            reconnect_armed: false,
        };

        debug!(session = %opts.id, "starting session actor");
        tokio::spawn(actor.run(receiver, inbox, transport_events, completion_rx));

        SessionHandle {
            id: opts.id,
            sender,
            events: opts.events,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut inbox: mpsc::UnboundedReceiver<WireMessage>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
        mut completion_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            let step = tokio::select! {
                cmd = commands.recv() => Step::Command(cmd),
                Some(msg) = inbox.recv() => Step::Inbound(msg),
                event = transport_events.recv() => Step::Transport(event),
                Some(done) = completion_rx.recv() => Step::Completed(done),
                () = self.reconnect.as_mut(), if self.reconnect_armed => Step::ReconnectDue,
            };

            let effects = match step {
                Step::Command(Some(SessionCommand::Shutdown { respond_to })) => {
                    self.shutdown();
                    let _ = respond_to.send(());
                    break;
                }
                Step::Command(Some(cmd)) => self.handle_command(cmd),
                Step::Command(None) => {
                    self.shutdown();
                    break;
                }
                Step::Inbound(msg) => self.machine.on_message(&msg),
                Step::Transport(Ok(TransportEvent::Dropped)) => {
                    self.pending = None;
                    self.machine.on_transport_dropped()
                }
                Step::Transport(Ok(TransportEvent::Closed)) => {
                    self.pending = None;
                    self.machine.on_transport_closed()
                }
                Step::Transport(Ok(TransportEvent::Open)) => Vec::new(),
                Step::Transport(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!(session = %self.id, skipped = n, "missed transport events");
                    Vec::new()
                }
                Step::Transport(Err(broadcast::error::RecvError::Closed)) => break,
                Step::Completed(done) => self.handle_completion(done),
                Step::ReconnectDue => {
                    self.reconnect_armed = false;
                    self.machine.on_reconnect_due()
                }
            };
            self.apply(effects);
        }

        self.transport.unroute(&self.id);
        debug!(session = %self.id, "session actor stopped");
    }

    fn handle_command(&mut self, cmd: SessionCommand) -> Vec<Effect> {
        match cmd {
            SessionCommand::Connect {
                config,
                auto_reconnect,
                respond_to,
            } => match self.machine.connect(config, auto_reconnect) {
                Ok(fx) => {
                    let _ = respond_to.send(Ok(()));
                    fx
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                    Vec::new()
                }
            },
            SessionCommand::Disconnect { respond_to } => match self.machine.disconnect() {
                Ok(fx) => {
                    let _ = respond_to.send(Ok(()));
                    fx
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                    Vec::new()
                }
            },
            SessionCommand::SendInput { bytes, respond_to } => {
                let result = self
                    .machine
                    .ensure_connected()
                    .and_then(|()| self.transport.send_data(&self.id, &bytes).map_err(Into::into));
                let _ = respond_to.send(result);
                Vec::new()
            }
            SessionCommand::Resize {
                cols,
                rows,
                respond_to,
            } => {
                let result = if self.machine.state().is_connected() {
                    self.transport
                        .resize(&self.id, cols, rows)
                        .map_err(SessionError::from)
                } else {
                    Ok(())
                };
                let _ = respond_to.send(result);
                Vec::new()
            }
            SessionCommand::SendFile {
                file_name,
                data,
                size,
                protocol,
                respond_to,
            } => {
                let result = self.machine.ensure_serial().and_then(|()| {
                    self.transport
                        .send_file(&self.id, &file_name, &data, &protocol)
                        .map_err(Into::into)
                });
                let fx = match &result {
                    Ok(()) => {
                        info!(session = %self.id, file = %file_name, size, "file send requested");
                        self.machine
                            .set_status_text(format!("Sending file: {file_name} ({size} bytes)"))
                    }
                    Err(e) => self
                        .machine
                        .set_status_text(format!("Cannot send file: {e}")),
                };
                let _ = respond_to.send(result);
                fx
            }
            SessionCommand::ReceiveFile {
                file_name,
                protocol,
                respond_to,
            } => {
                let result = self.machine.ensure_serial().and_then(|()| {
                    self.transport
                        .receive_file(&self.id, &file_name, &protocol)
                        .map_err(Into::into)
                });
                let fx = match &result {
                    Ok(()) => self
                        .machine
                        .set_status_text(format!("Waiting to receive file: {file_name}...")),
                    Err(e) => self
                        .machine
                        .set_status_text(format!("Cannot receive file: {e}")),
                };
                let _ = respond_to.send(result);
                fx
            }
            SessionCommand::Echo { bytes, respond_to } => {
                let _ = respond_to.send(());
                vec![Effect::Emit(SessionEventKind::Output(bytes))]
            }
            SessionCommand::SetStatus { status, respond_to } => {
                let _ = respond_to.send(());
                self.machine.set_status_text(status)
            }
            SessionCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.machine.snapshot());
                Vec::new()
            }
            // handled by the run loop
            SessionCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
                Vec::new()
            }
        }
    }

    fn handle_completion(&mut self, done: Completion) -> Vec<Effect> {
        match done {
            Completion::TransportReady(Ok(())) => self.flush_pending(),
            Completion::TransportReady(Err(e)) => match self.pending.take() {
                Some(_) => self.machine.on_open_failed(&e.to_string()),
                None => Vec::new(),
            },
            Completion::SshOpened {
                attempt,
                result: Ok(remote_id),
            } => self.machine.on_ssh_opened(attempt, remote_id),
            Completion::SshOpened {
                attempt,
                result: Err(message),
            } => self.machine.on_ssh_failed(attempt, &message),
            Completion::SshClosed(Ok(())) => Vec::new(),
            Completion::SshClosed(Err(message)) => self.machine.on_ssh_close_failed(&message),
        }
    }

    /// Send whatever was waiting on the transport.
    fn flush_pending(&mut self) -> Vec<Effect> {
        let sent = match self.pending.take() {
            Some(PendingOpen::Serial(config)) => self.transport.open_serial(&self.id, &config),
            Some(PendingOpen::Attach(remote_id)) => self.transport.attach_ssh(&self.id, &remote_id),
            None => return Vec::new(),
        };
        match sent {
            Ok(()) => Vec::new(),
            Err(e) => self.machine.on_open_failed(&e.to_string()),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            let more = match effect {
                Effect::OpenSerial(config) => self.await_transport(PendingOpen::Serial(config)),
                Effect::AttachSsh(remote_id) => self.await_transport(PendingOpen::Attach(remote_id)),
                Effect::OpenSsh { config, attempt } => {
                    let ssh = Arc::clone(&self.ssh);
                    let completions = self.completions.clone();
                    tokio::spawn(async move {
                        let result = ssh.open(config).await.map_err(|e| e.to_string());
                        let _ = completions.send(Completion::SshOpened { attempt, result });
                    });
                    Vec::new()
                }
                Effect::CloseSerial => {
                    self.pending = None;
                    if let Err(e) = self.transport.close_port(&self.id) {
                        debug!(session = %self.id, error = %e, "close request not sent");
                    }
                    Vec::new()
                }
                Effect::CloseSsh(remote_id) => {
                    self.pending = None;
                    let ssh = Arc::clone(&self.ssh);
                    let completions = self.completions.clone();
                    tokio::spawn(async move {
                        let result = ssh.close(remote_id).await.map_err(|e| e.to_string());
                        let _ = completions.send(Completion::SshClosed(result));
                    });
                    Vec::new()
                }
                Effect::ArmReconnect(delay) => {
                    self.reconnect.as_mut().reset(Instant::now() + delay);
                    self.reconnect_armed = true;
                    Vec::new()
                }
                Effect::CancelReconnect => {
                    self.reconnect_armed = false;
                    Vec::new()
                }
                Effect::Emit(kind) => {
                    let _ = self.events.send(SessionEvent {
                        session_id: self.id.clone(),
                        kind,
                    });
                    Vec::new()
                }
            };
            queue.extend(more);
        }
    }

    fn await_transport(&mut self, pending: PendingOpen) -> Vec<Effect> {
        self.pending = Some(pending);
        if self.transport.is_open() {
            return self.flush_pending();
        }
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = transport.connect().await;
            let _ = completions.send(Completion::TransportReady(result));
        });
        Vec::new()
    }

    fn shutdown(&mut self) {
        if let Ok(fx) = self.machine.disconnect() {
            self.apply(fx);
        }
        self.reconnect_armed = false;
        info!(session = %self.id, "session closed");
    }
}
