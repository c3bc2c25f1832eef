//! Connection lifecycle of one session, free of I/O.
//!
//! Every transition returns the [`Effect`]s the caller must carry out. The
//! session actor owns the socket, the REST client and the reconnect timer;
//! this type only decides what should happen to them.

use std::time::Duration;

use flux_protocol::{
    ConnectionConfig, ConnectionKind, DataPayload, FileTransferAction, FileTransferPayload,
    Payload, SerialConfig, SshConfig, StatusPayload, StatusState, WireMessage,
};
use tracing::{debug, info, warn};

use super::event::{ConnectionState, SessionEventKind, SessionSnapshot};
use crate::error::SessionError;

/// Exponential backoff for automatic serial reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^attempt`, capped at `max_delay`. `attempt` is 0-indexed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Work requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Ensure the transport is open, then send a `connect` control.
    OpenSerial(SerialConfig),
    /// Create a remote SSH session over REST. The reply must carry `attempt` back.
    OpenSsh { config: SshConfig, attempt: u64 },
    /// Ensure the transport is open, then attach to the remote SSH session.
    AttachSsh(String),
    /// Send a `disconnect` control for the serial port.
    CloseSerial,
    /// Delete the remote SSH session over REST.
    CloseSsh(String),
    ArmReconnect(Duration),
    CancelReconnect,
    Emit(SessionEventKind),
}

#[derive(Debug)]
pub struct SessionMachine {
    session_id: String,
    state: ConnectionState,
    config: Option<ConnectionConfig>,
    auto_reconnect: bool,
    attempts: u32,
    ssh_session: Option<String>,
    reconnect_armed: bool,
    status: String,
    policy: ReconnectPolicy,
    /// Bumped on every `connect`; SSH replies from older attempts are stale.
    connect_attempt: u64,
}

impl SessionMachine {
    pub fn new(session_id: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            session_id: session_id.into(),
            state: ConnectionState::Disconnected,
            config: None,
            auto_reconnect: false,
            attempts: 0,
            ssh_session: None,
            reconnect_armed: false,
            status: "Disconnected".to_string(),
            policy,
            connect_attempt: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.config.as_ref()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn ssh_session(&self) -> Option<&str> {
        self.ssh_session.as_deref()
    }

    pub fn is_reconnect_armed(&self) -> bool {
        self.reconnect_armed
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            state: self.state,
            config: self.config.clone(),
            auto_reconnect: self.auto_reconnect,
            reconnect_attempts: self.attempts,
            ssh_session: self.ssh_session.clone(),
            status: self.status.clone(),
        }
    }

    // =========================================================================
    // User intents
    // =========================================================================

    /// Start a connection. Valid from `Disconnected` and `Reconnecting`.
    ///
    /// Auto-reconnect only ever applies to serial connections.
    pub fn connect(
        &mut self,
        config: ConnectionConfig,
        auto_reconnect: bool,
    ) -> Result<Vec<Effect>, SessionError> {
        if !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Reconnecting
        ) {
            return Err(SessionError::InvalidTransition {
                action: "connect",
                state: self.state,
            });
        }
        config.validate()?;

        let mut fx = Vec::new();
        self.cancel_reconnect(&mut fx);
        self.attempts = 0;
        self.connect_attempt += 1;
        self.auto_reconnect = auto_reconnect && config.kind() == ConnectionKind::Serial;
        self.set_config(Some(config.clone()), &mut fx);
        self.transition(ConnectionState::Connecting, &mut fx);

        info!(
            session = %self.session_id,
            target = %config.label(),
            auto_reconnect = self.auto_reconnect,
            "connecting"
        );

        match config {
            ConnectionConfig::Serial(serial) => {
                self.set_status("Connecting...", &mut fx);
                fx.push(Effect::OpenSerial(serial));
            }
            ConnectionConfig::Ssh(ssh) => {
                self.set_status("Connecting to SSH...", &mut fx);
                output(
                    format!(
                        "\r\n\x1b[36m[SSH]\x1b[0m Connecting to {}:{}...\r\n",
                        ssh.host, ssh.port
                    ),
                    &mut fx,
                );
                fx.push(Effect::OpenSsh {
                    config: ssh,
                    attempt: self.connect_attempt,
                });
            }
        }
        Ok(fx)
    }

    /// Manual disconnect. Clears auto-reconnect and the stored config.
    pub fn disconnect(&mut self) -> Result<Vec<Effect>, SessionError> {
        if self.state == ConnectionState::Disconnected {
            return Err(SessionError::InvalidTransition {
                action: "disconnect",
                state: self.state,
            });
        }

        let mut fx = Vec::new();
        let was = self.state;
        self.auto_reconnect = false;
        self.cancel_reconnect(&mut fx);

        match self.config.as_ref().map(ConnectionConfig::kind) {
            Some(ConnectionKind::Ssh) => {
                if let Some(remote) = self.ssh_session.take() {
                    fx.push(Effect::CloseSsh(remote));
                }
                output("\r\n[SSH] Disconnected\r\n", &mut fx);
                self.set_status("SSH disconnected", &mut fx);
            }
            _ => {
                // a port only needs closing if an open was sent
                if matches!(
                    was,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    fx.push(Effect::CloseSerial);
                }
                self.set_status("Disconnected", &mut fx);
            }
        }

        self.set_config(None, &mut fx);
        self.transition(ConnectionState::Disconnected, &mut fx);
        info!(session = %self.session_id, from = %was, "disconnected by user");
        Ok(fx)
    }

    // =========================================================================
    // Inbound frames
    // =========================================================================

    pub fn on_message(&mut self, message: &WireMessage) -> Vec<Effect> {
        match message.decode() {
            Ok(Payload::Data(data)) => self.on_data(&data),
            Ok(Payload::Status(status)) => self.on_status(&status),
            Ok(Payload::Error(err)) => self.on_error(&err.message),
            Ok(Payload::FileTransfer(progress)) => self.on_file_transfer(&progress),
            Ok(Payload::Control(control)) => {
                debug!(session = %self.session_id, action = ?control.action, "ignoring inbound control frame");
                Vec::new()
            }
            Err(e) => {
                warn!(session = %self.session_id, kind = ?message.kind, error = %e, "dropping undecodable frame");
                Vec::new()
            }
        }
    }

    pub fn on_status(&mut self, status: &StatusPayload) -> Vec<Effect> {
        let mut fx = Vec::new();
        let display = status
            .message
            .clone()
            .unwrap_or_else(|| status_label(status.state).to_string());

        match status.state {
            StatusState::Connected => {
                if self.state != ConnectionState::Connecting {
                    debug!(session = %self.session_id, state = %self.state, "ignoring connected status");
                    return fx;
                }
                self.attempts = 0;
                self.cancel_reconnect(&mut fx);
                self.transition(ConnectionState::Connected, &mut fx);
                self.set_status(display, &mut fx);
                info!(session = %self.session_id, "connected");
            }
            StatusState::Disconnected | StatusState::Ready => {
                if !matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    debug!(session = %self.session_id, state = %self.state, status = ?status.state, "ignoring status");
                    return fx;
                }
                self.lose_connection(display, &mut fx);
            }
            StatusState::Error => {
                let message = status.message.as_deref().unwrap_or("Unknown error");
                return self.on_error(message);
            }
            StatusState::Connecting => self.set_status(display, &mut fx),
        }
        fx
    }

    /// Error frames never change state.
    pub fn on_error(&mut self, message: &str) -> Vec<Effect> {
        let mut fx = Vec::new();
        warn!(session = %self.session_id, "gateway error: {}", message);
        self.set_status(format!("Error: {message}"), &mut fx);
        output(format!("\r\n[ERROR] {message}\r\n"), &mut fx);
        fx
    }

    pub fn on_data(&mut self, data: &DataPayload) -> Vec<Effect> {
        match data.to_bytes() {
            Ok(bytes) => vec![Effect::Emit(SessionEventKind::Output(bytes))],
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "dropping undecodable data frame");
                Vec::new()
            }
        }
    }

    pub fn on_file_transfer(&mut self, progress: &FileTransferPayload) -> Vec<Effect> {
        let mut fx = vec![Effect::Emit(SessionEventKind::FileTransfer(progress.clone()))];
        match progress.action {
            FileTransferAction::Start => output(
                format!(
                    "\r\n[FILE TRANSFER] {}\r\n",
                    progress.message.as_deref().unwrap_or(&progress.file_name)
                ),
                &mut fx,
            ),
            FileTransferAction::Complete => output(
                format!(
                    "\r\n[FILE TRANSFER] {} - Transfer complete\r\n",
                    progress.file_name
                ),
                &mut fx,
            ),
            FileTransferAction::Error => output(
                format!(
                    "\r\n[FILE TRANSFER ERROR] {}\r\n",
                    progress.error.as_deref().unwrap_or("unknown error")
                ),
                &mut fx,
            ),
            FileTransferAction::Progress => {}
        }
        fx
    }

    // =========================================================================
    // Transport, timer and REST outcomes
    // =========================================================================

    /// The shared socket ended unexpectedly.
    pub fn on_transport_dropped(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.lose_connection("Gateway connection lost".to_string(), &mut fx);
        }
        fx
    }

    /// The shared socket was closed on purpose; nothing to reconnect to.
    pub fn on_transport_closed(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.state == ConnectionState::Disconnected {
            return fx;
        }
        self.auto_reconnect = false;
        self.cancel_reconnect(&mut fx);
        self.settle_disconnected("Gateway connection closed".to_string(), &mut fx);
        fx
    }

    /// The transport could not be opened, or the open request could not be sent.
    pub fn on_open_failed(&mut self, reason: &str) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(session = %self.session_id, state = %self.state, "ignoring stale open failure");
            return fx;
        }
        warn!(session = %self.session_id, "open failed: {}", reason);
        self.lose_connection(format!("Connection failed: {reason}"), &mut fx);
        fx
    }

    /// The backoff timer fired. Does not reset the attempt counter.
    pub fn on_reconnect_due(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.reconnect_armed || self.state != ConnectionState::Reconnecting {
            debug!(session = %self.session_id, state = %self.state, "ignoring stale reconnect timer");
            return fx;
        }
        self.reconnect_armed = false;

        let Some(ConnectionConfig::Serial(serial)) = self.config.clone() else {
            self.settle_disconnected("Disconnected".to_string(), &mut fx);
            return fx;
        };

        info!(session = %self.session_id, attempt = self.attempts, "auto-reconnecting");
        self.transition(ConnectionState::Connecting, &mut fx);
        self.set_status("Connecting...", &mut fx);
        fx.push(Effect::OpenSerial(serial));
        fx
    }

    /// REST created the remote SSH session for connect attempt `attempt`.
    pub fn on_ssh_opened(&mut self, attempt: u64, remote_id: String) -> Vec<Effect> {
        let mut fx = Vec::new();
        let wants_ssh = matches!(self.config, Some(ConnectionConfig::Ssh(_)));
        let current = attempt == self.connect_attempt;
        if !current || self.state != ConnectionState::Connecting || !wants_ssh {
            debug!(session = %self.session_id, remote = %remote_id, "closing orphaned ssh session");
            fx.push(Effect::CloseSsh(remote_id));
            return fx;
        }

        output(
            format!("\x1b[32m[SSH]\x1b[0m Session created (ID: {remote_id})\r\n"),
            &mut fx,
        );
        output("\x1b[36m[SSH]\x1b[0m Attaching terminal...\r\n", &mut fx);
        self.ssh_session = Some(remote_id.clone());
        self.attempts = 0;
        self.transition(ConnectionState::Connected, &mut fx);
        fx.push(Effect::AttachSsh(remote_id));
        output(
            "\x1b[32m[SSH]\x1b[0m Connected! Ready for input.\r\n\r\n",
            &mut fx,
        );
        self.set_status("SSH ready", &mut fx);
        info!(session = %self.session_id, "ssh session ready");
        fx
    }

    pub fn on_ssh_failed(&mut self, attempt: u64, message: &str) -> Vec<Effect> {
        let mut fx = Vec::new();
        if attempt != self.connect_attempt || self.state != ConnectionState::Connecting {
            debug!(session = %self.session_id, attempt, "ignoring stale ssh failure");
            return fx;
        }
        warn!(session = %self.session_id, "ssh connect failed: {}", message);
        output(format!("\x1b[31m[SSH ERROR]\x1b[0m {message}\r\n"), &mut fx);
        self.transition(ConnectionState::Disconnected, &mut fx);
        self.set_config(None, &mut fx);
        self.set_status(format!("SSH connection failed: {message}"), &mut fx);
        fx
    }

    /// The session is already `Disconnected`; only the status line changes.
    pub fn on_ssh_close_failed(&mut self, message: &str) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.set_status(format!("SSH disconnect failed: {message}"), &mut fx);
        fx
    }

    // =========================================================================
    // Guards for data-plane requests
    // =========================================================================

    pub fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    pub fn ensure_serial(&self) -> Result<(), SessionError> {
        self.ensure_connected()?;
        match self.config {
            Some(ConnectionConfig::Serial(_)) => Ok(()),
            _ => Err(SessionError::NotSerial),
        }
    }

    pub fn set_status_text(&mut self, status: impl Into<String>) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.set_status(status, &mut fx);
        fx
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Connection lost while `Connecting` or `Connected`: back off and retry,
    /// or settle in `Disconnected`.
    fn lose_connection(&mut self, reason: String, fx: &mut Vec<Effect>) {
        let can_retry = self.auto_reconnect
            && matches!(self.config, Some(ConnectionConfig::Serial(_)));

        if can_retry && self.attempts < self.policy.max_attempts {
            let delay = self.policy.delay_for(self.attempts);
            self.attempts += 1;
            self.reconnect_armed = true;
            fx.push(Effect::ArmReconnect(delay));
            self.transition(ConnectionState::Reconnecting, fx);
            self.set_status(
                format!(
                    "Reconnecting in {}s... (attempt {}/{})",
                    (delay.as_millis() + 500) / 1000,
                    self.attempts,
                    self.policy.max_attempts
                ),
                fx,
            );
            info!(
                session = %self.session_id,
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                "connection lost, reconnect scheduled"
            );
            return;
        }

        if can_retry {
            warn!(
                session = %self.session_id,
                attempts = self.attempts,
                "giving up after repeated reconnect failures"
            );
            self.auto_reconnect = false;
            self.settle_disconnected(
                format!(
                    "Reconnect failed after {} attempts",
                    self.policy.max_attempts
                ),
                fx,
            );
        } else {
            info!(session = %self.session_id, "connection lost: {}", reason);
            self.settle_disconnected(reason, fx);
        }
    }

    fn settle_disconnected(&mut self, status: String, fx: &mut Vec<Effect>) {
        if let Some(remote) = self.ssh_session.take() {
            fx.push(Effect::CloseSsh(remote));
        }
        self.transition(ConnectionState::Disconnected, fx);
        self.set_config(None, fx);
        self.set_status(status, fx);
    }

    fn cancel_reconnect(&mut self, fx: &mut Vec<Effect>) {
        if self.reconnect_armed {
            self.reconnect_armed = false;
            fx.push(Effect::CancelReconnect);
        }
    }

    fn transition(&mut self, to: ConnectionState, fx: &mut Vec<Effect>) {
        if self.state != to {
            debug!(session = %self.session_id, from = %self.state, to = %to, "state change");
            self.state = to;
            fx.push(Effect::Emit(SessionEventKind::StateChanged(to)));
        }
    }

    fn set_config(&mut self, config: Option<ConnectionConfig>, fx: &mut Vec<Effect>) {
        if self.config != config {
            self.config = config.clone();
            fx.push(Effect::Emit(SessionEventKind::ConfigChanged(config)));
        }
    }

    fn set_status(&mut self, status: impl Into<String>, fx: &mut Vec<Effect>) {
        let status = status.into();
        self.status = status.clone();
        fx.push(Effect::Emit(SessionEventKind::Status(status)));
    }
}

fn output(text: impl Into<String>, fx: &mut Vec<Effect>) {
    fx.push(Effect::Emit(SessionEventKind::Output(text.into().into_bytes())));
}

fn status_label(state: StatusState) -> &'static str {
    match state {
        StatusState::Connected => "connected",
        StatusState::Disconnected => "disconnected",
        StatusState::Connecting => "connecting",
        StatusState::Error => "error",
        StatusState::Ready => "ready",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_protocol::{DataEncoding, ErrorPayload};

    fn serial() -> ConnectionConfig {
        SerialConfig::new("/dev/ttyUSB0").into()
    }

    fn ssh() -> ConnectionConfig {
        SshConfig::with_password("10.0.0.2", "pi", "raspberry").into()
    }

    fn machine() -> SessionMachine {
        SessionMachine::new("session-0", ReconnectPolicy::default())
    }

    fn status(state: StatusState) -> StatusPayload {
        StatusPayload::new(state)
    }

    fn armed_delay(fx: &[Effect]) -> Option<Duration> {
        fx.iter().find_map(|e| match e {
            Effect::ArmReconnect(d) => Some(*d),
            _ => None,
        })
    }

    fn opens_serial(fx: &[Effect]) -> bool {
        fx.iter().any(|e| matches!(e, Effect::OpenSerial(_)))
    }

    fn outputs(fx: &[Effect]) -> String {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Emit(SessionEventKind::Output(bytes)) => {
                    Some(String::from_utf8_lossy(bytes).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn policy_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..6)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
        assert_eq!(policy.delay_for(40), Duration::from_millis(10_000));
    }

    #[test]
    fn connect_moves_to_connecting_and_opens() {
        let mut m = machine();
        let fx = m.connect(serial(), true).unwrap();

        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.status(), "Connecting...");
        assert!(m.auto_reconnect());
        assert!(opens_serial(&fx));
        assert!(fx.contains(&Effect::Emit(SessionEventKind::StateChanged(
            ConnectionState::Connecting
        ))));
        assert!(fx.contains(&Effect::Emit(SessionEventKind::ConfigChanged(Some(serial())))));
    }

    #[test]
    fn connect_while_connecting_is_rejected() {
        let mut m = machine();
        m.connect(serial(), false).unwrap();
        let err = m.connect(serial(), false).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                action: "connect",
                state: ConnectionState::Connecting
            }
        ));
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn invalid_config_blocks_connect() {
        let mut m = machine();
        let err = m.connect(SerialConfig::new("").into(), false).unwrap_err();
        assert_eq!(err.to_string(), "Serial port is required");
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.config().is_none());
    }

    #[test]
    fn connected_status_only_counts_while_connecting() {
        let mut m = machine();
        assert!(m.on_status(&status(StatusState::Connected)).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);

        m.connect(serial(), false).unwrap();
        m.on_status(&StatusPayload::with_message(
            StatusState::Connected,
            "Connected to /dev/ttyUSB0",
        ));
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.status(), "Connected to /dev/ttyUSB0");
    }

    #[test]
    fn drop_without_auto_reconnect_settles_disconnected() {
        let mut m = machine();
        m.connect(serial(), false).unwrap();
        m.on_status(&status(StatusState::Connected));

        let fx = m.on_status(&status(StatusState::Disconnected));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(armed_delay(&fx).is_none());
        assert!(m.config().is_none());
    }

    #[test]
    fn first_drop_arms_one_second_timer() {
        let mut m = machine();
        m.connect(serial(), true).unwrap();
        m.on_status(&status(StatusState::Connected));

        let fx = m.on_status(&status(StatusState::Disconnected));
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert_eq!(m.attempts(), 1);
        assert_eq!(armed_delay(&fx), Some(Duration::from_millis(1000)));
        assert_eq!(m.status(), "Reconnecting in 1s... (attempt 1/5)");
        assert!(m.config().is_some());
    }

    #[test]
    fn backoff_runs_five_attempts_then_gives_up() {
        let mut m = machine();
        m.connect(serial(), true).unwrap();
        m.on_status(&status(StatusState::Connected));

        let mut delays = Vec::new();
        let mut fx = m.on_status(&status(StatusState::Disconnected));
        while let Some(delay) = armed_delay(&fx) {
            delays.push(delay.as_millis() as u64);
            let fire = m.on_reconnect_due();
            assert!(opens_serial(&fire));
            assert_eq!(m.state(), ConnectionState::Connecting);
            fx = m.on_status(&status(StatusState::Disconnected));
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.config().is_none());
        assert!(!m.auto_reconnect());
        assert!(!m.is_reconnect_armed());
    }

    #[test]
    fn successful_reconnect_resets_counter() {
        let mut m = machine();
        m.connect(serial(), true).unwrap();
        m.on_status(&status(StatusState::Connected));
        m.on_status(&status(StatusState::Disconnected));
        m.on_reconnect_due();
        m.on_status(&status(StatusState::Disconnected));
        assert_eq!(m.attempts(), 2);

        m.on_reconnect_due();
        m.on_status(&status(StatusState::Connected));
        assert_eq!(m.attempts(), 0);

        let fx = m.on_status(&status(StatusState::Disconnected));
        assert_eq!(armed_delay(&fx), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn ready_is_ignored_unless_connecting_or_connected() {
        let mut m = machine();
        assert!(m.on_status(&status(StatusState::Ready)).is_empty());

        m.connect(serial(), true).unwrap();
        m.on_status(&status(StatusState::Connected));
        m.on_status(&status(StatusState::Ready));
        assert_eq!(m.state(), ConnectionState::Reconnecting);

        // a second notice while already waiting must not arm another timer
        let fx = m.on_status(&status(StatusState::Disconnected));
        assert!(fx.is_empty());
        assert_eq!(m.attempts(), 1);
    }

    #[test]
    fn error_frame_keeps_state() {
        let mut m = machine();
        m.connect(serial(), false).unwrap();
        m.on_status(&status(StatusState::Connected));

        let msg = WireMessage::error(
            Some("session-0"),
            ErrorPayload {
                code: "PORT_BUSY".to_string(),
                message: "port busy".to_string(),
            },
        );
        let fx = m.on_message(&msg);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.status(), "Error: port busy");
        assert_eq!(outputs(&fx), "\r\n[ERROR] port busy\r\n");

        m.on_status(&status(StatusState::Error));
        assert_eq!(m.status(), "Error: Unknown error");
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn manual_disconnect_while_reconnecting_cancels_timer() {
        let mut m = machine();
        m.connect(serial(), true).unwrap();
        m.on_status(&status(StatusState::Connected));
        m.on_status(&status(StatusState::Disconnected));

        let fx = m.disconnect().unwrap();
        assert!(fx.contains(&Effect::CancelReconnect));
        assert!(!fx.contains(&Effect::CloseSerial));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.auto_reconnect());
        assert!(m.config().is_none());

        assert!(m.on_reconnect_due().is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_when_connected_closes_port() {
        let mut m = machine();
        m.connect(serial(), false).unwrap();
        m.on_status(&status(StatusState::Connected));
        let fx = m.disconnect().unwrap();
        assert!(fx.contains(&Effect::CloseSerial));
        assert_eq!(m.status(), "Disconnected");

        // the gateway's confirmation arrives afterwards and changes nothing
        assert!(m.on_status(&status(StatusState::Disconnected)).is_empty());
    }

    #[test]
    fn disconnect_while_disconnected_is_rejected() {
        let mut m = machine();
        assert!(matches!(
            m.disconnect(),
            Err(SessionError::InvalidTransition {
                action: "disconnect",
                ..
            })
        ));
    }

    #[test]
    fn connect_from_reconnecting_resets_and_cancels() {
        let mut m = machine();
        m.connect(serial(), true).unwrap();
        m.on_status(&status(StatusState::Connected));
        m.on_status(&status(StatusState::Disconnected));
        assert_eq!(m.state(), ConnectionState::Reconnecting);

        let fx = m.connect(serial(), true).unwrap();
        assert!(fx.contains(&Effect::CancelReconnect));
        assert_eq!(m.attempts(), 0);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn transport_drop_is_a_disconnect() {
        let mut m = machine();
        m.connect(serial(), true).unwrap();
        m.on_status(&status(StatusState::Connected));
        let fx = m.on_transport_dropped();
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert!(armed_delay(&fx).is_some());

        // idle sessions are unaffected
        let mut idle = machine();
        assert!(idle.on_transport_dropped().is_empty());
    }

    #[test]
    fn open_failure_on_reconnect_counts_as_attempt() {
        let mut m = machine();
        m.connect(serial(), true).unwrap();
        m.on_status(&status(StatusState::Connected));
        m.on_status(&status(StatusState::Disconnected));
        m.on_reconnect_due();

        let fx = m.on_open_failed("gateway is unavailable");
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert_eq!(m.attempts(), 2);
        assert_eq!(armed_delay(&fx), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn ssh_connect_never_auto_reconnects() {
        let mut m = machine();
        let fx = m.connect(ssh(), true).unwrap();
        assert!(!m.auto_reconnect());
        assert!(matches!(fx.last(), Some(Effect::OpenSsh { attempt: 1, .. })));
        assert_eq!(m.status(), "Connecting to SSH...");

        let fx = m.on_ssh_opened(1, "ssh-7".to_string());
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.ssh_session(), Some("ssh-7"));
        assert!(fx.contains(&Effect::AttachSsh("ssh-7".to_string())));
        assert_eq!(m.status(), "SSH ready");

        let fx = m.on_status(&status(StatusState::Disconnected));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(armed_delay(&fx).is_none());
        assert!(fx.contains(&Effect::CloseSsh("ssh-7".to_string())));
    }

    #[test]
    fn ssh_disconnect_closes_remote_session() {
        let mut m = machine();
        m.connect(ssh(), false).unwrap();
        m.on_ssh_opened(1, "ssh-1".to_string());
        let fx = m.disconnect().unwrap();
        assert!(fx.contains(&Effect::CloseSsh("ssh-1".to_string())));
        assert!(!fx.contains(&Effect::CloseSerial));
        assert_eq!(m.status(), "SSH disconnected");
        assert!(outputs(&fx).contains("[SSH] Disconnected"));
    }

    #[test]
    fn late_ssh_success_is_closed() {
        let mut m = machine();
        m.connect(ssh(), false).unwrap();
        m.disconnect().unwrap();
        let fx = m.on_ssh_opened(1, "ssh-9".to_string());
        assert_eq!(fx, vec![Effect::CloseSsh("ssh-9".to_string())]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    fn open_ssh_attempt(fx: &[Effect]) -> u64 {
        fx.iter()
            .find_map(|e| match e {
                Effect::OpenSsh { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn reply_from_previous_connect_is_not_attached() {
        let mut m = machine();
        let first = open_ssh_attempt(&m.connect(ssh(), false).unwrap());
        m.disconnect().unwrap();
        let host_b: ConnectionConfig = SshConfig::with_password("10.0.0.3", "pi", "raspberry").into();
        let second = open_ssh_attempt(&m.connect(host_b, false).unwrap());
        assert_ne!(first, second);

        // host-a answers after host-b was requested
        let fx = m.on_ssh_opened(first, "ssh-a".to_string());
        assert_eq!(fx, vec![Effect::CloseSsh("ssh-a".to_string())]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.ssh_session(), None);

        // a stale failure does not abort the current attempt either
        assert!(m.on_ssh_failed(first, "timed out").is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);

        let fx = m.on_ssh_opened(second, "ssh-b".to_string());
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.ssh_session(), Some("ssh-b"));
        assert!(fx.contains(&Effect::AttachSsh("ssh-b".to_string())));
    }

    #[test]
    fn ssh_failure_returns_to_disconnected() {
        let mut m = machine();
        m.connect(ssh(), false).unwrap();
        let fx = m.on_ssh_failed(1, "authentication failed");
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.status(), "SSH connection failed: authentication failed");
        assert!(outputs(&fx).contains("[SSH ERROR]"));
    }

    #[test]
    fn undecodable_data_is_dropped() {
        let mut m = machine();
        let fx = m.on_data(&DataPayload {
            data: "***".to_string(),
            encoding: DataEncoding::Base64,
        });
        assert!(fx.is_empty());

        let fx = m.on_data(&DataPayload::from_bytes(b"login: "));
        assert_eq!(outputs(&fx), "login: ");
    }

    #[test]
    fn file_transfer_progress_is_published() {
        let mut m = machine();
        let progress = FileTransferPayload {
            action: FileTransferAction::Complete,
            file_name: "fw.bin".to_string(),
            file_size: 1024,
            sent: 1024,
            received: 0,
            message: None,
            error: None,
        };
        let fx = m.on_file_transfer(&progress);
        assert_eq!(
            fx[0],
            Effect::Emit(SessionEventKind::FileTransfer(progress.clone()))
        );
        assert_eq!(
            outputs(&fx),
            "\r\n[FILE TRANSFER] fw.bin - Transfer complete\r\n"
        );
    }

    #[test]
    fn data_plane_guards() {
        let mut m = machine();
        assert!(matches!(m.ensure_connected(), Err(SessionError::NotConnected)));

        m.connect(ssh(), false).unwrap();
        m.on_ssh_opened(1, "ssh-2".to_string());
        assert!(m.ensure_connected().is_ok());
        assert!(matches!(m.ensure_serial(), Err(SessionError::NotSerial)));
    }
}
