//! Macro playback into a connected session.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{SessionError, StoreError};
use crate::session::SessionHandle;
use crate::store::{Macro, MacroStore};

#[derive(Debug, thiserror::Error)]
pub enum MacroError {
    #[error("no macro named or with id {0}")]
    UnknownMacro(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Type each command followed by `line_ending`, echoing `> cmd` locally.
/// Waits `delay` ms between commands but not after the last one.
/// Returns the number of commands sent.
pub async fn run_macro(
    handle: &SessionHandle,
    entry: &Macro,
    line_ending: &str,
) -> Result<usize, SessionError> {
    let snapshot = handle.snapshot().await?;
    if !snapshot.state.is_connected() {
        return Err(SessionError::NotConnected);
    }

    info!(session = handle.id(), name = %entry.name, commands = entry.commands.len(), "running macro");
    handle
        .set_status(format!("Executing macro: {}...", entry.name))
        .await?;

    let delay = Duration::from_millis(entry.delay);
    for (i, command) in entry.commands.iter().enumerate() {
        let line = format!("{command}{line_ending}");
        if let Err(e) = handle.send_input(line.as_bytes()).await {
            warn!(session = handle.id(), name = %entry.name, error = %e, "macro aborted");
            handle.set_status(format!("Macro failed: {e}")).await?;
            return Err(e);
        }
        handle.echo(format!("> {command}\r\n").as_bytes()).await?;

        if i + 1 < entry.commands.len() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    let count = entry.commands.len();
    handle
        .set_status(format!("Macro \"{}\" executed ({count} commands)", entry.name))
        .await?;
    Ok(count)
}

/// Look a macro up by id or name, run it and record the use.
pub async fn run_stored_macro(
    handle: &SessionHandle,
    store: &mut MacroStore,
    id_or_name: &str,
    line_ending: &str,
) -> Result<usize, MacroError> {
    let entry = store
        .find(id_or_name)
        .cloned()
        .ok_or_else(|| MacroError::UnknownMacro(id_or_name.to_string()))?;
    let count = run_macro(handle, &entry, line_ending).await?;
    store.touch(&entry.id)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use flux_protocol::{MessageKind, Payload, SerialConfig, SshConfig, StatusState};
    use futures::future::BoxFuture;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    use crate::api::SshGateway;
    use crate::error::ApiError;
    use crate::session::{
        ConnectionState, ReconnectPolicy, SessionActor, SessionEvent, SessionEventKind,
        SpawnOptions,
    };
    use crate::transport::TransportClient;
    use crate::transport::testing::{MockDialer, MockPeer};

    struct NoSsh;

    impl SshGateway for NoSsh {
        fn open(&self, _config: SshConfig) -> BoxFuture<'static, Result<String, ApiError>> {
            Box::pin(async { Err(ApiError::Unavailable) })
        }

        fn close(&self, _remote_id: String) -> BoxFuture<'static, Result<(), ApiError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn boot_macro(delay: u64) -> Macro {
        Macro {
            id: "1".to_string(),
            name: "boot".to_string(),
            commands: vec!["reset".to_string(), "boot".to_string()],
            delay,
            description: None,
            created_at: Utc::now(),
            last_used: None,
        }
    }

    async fn connected_session() -> (SessionHandle, broadcast::Receiver<SessionEvent>, MockPeer) {
        let (dialer, mut peers) = MockDialer::new();
        let transport = TransportClient::with_dialer("ws://gateway/ws", dialer);
        let (events, mut rx) = broadcast::channel(256);
        let handle = SessionActor::spawn(SpawnOptions {
            id: "session-0".to_string(),
            transport,
            ssh: Arc::new(NoSsh),
            policy: ReconnectPolicy::default(),
            events,
        });
        handle
            .connect(SerialConfig::new("/dev/ttyUSB0").into(), false)
            .await
            .unwrap();
        let mut peer = peers.recv().await.unwrap();
        peer.next_control().await;
        peer.push_status("session-0", StatusState::Connected);
        // the status line trails the state change
        loop {
            let event = rx.recv().await.unwrap();
            if event.kind == SessionEventKind::Status("connected".to_string()) {
                break;
            }
        }
        assert_eq!(
            handle.snapshot().await.unwrap().state,
            ConnectionState::Connected
        );
        (handle, rx, peer)
    }

    async fn next_data(peer: &mut MockPeer) -> Vec<u8> {
        let msg = peer.next_message().await;
        assert_eq!(msg.kind, MessageKind::Data);
        match msg.decode().unwrap() {
            Payload::Data(data) => data.to_bytes().unwrap(),
            other => panic!("expected data payload, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_each_command_with_delay_between() {
        let (handle, mut events, mut peer) = connected_session().await;
        let started = Instant::now();

        let count = run_macro(&handle, &boot_macro(300), "\r\n").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(next_data(&mut peer).await, b"reset\r\n");
        assert_eq!(next_data(&mut peer).await, b"boot\r\n");
        // one gap, nothing after the last command
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        let mut echoed = Vec::new();
        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event.kind {
                SessionEventKind::Output(bytes) => echoed.extend(bytes),
                SessionEventKind::Status(status) => statuses.push(status),
                _ => {}
            }
        }
        assert_eq!(echoed, b"> reset\r\n> boot\r\n");
        assert_eq!(
            statuses,
            vec![
                "Executing macro: boot...".to_string(),
                "Macro \"boot\" executed (2 commands)".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_to_run_while_disconnected() {
        let (dialer, _peers) = MockDialer::new();
        let (events, _) = broadcast::channel(16);
        let handle = SessionActor::spawn(SpawnOptions {
            id: "session-0".to_string(),
            transport: TransportClient::with_dialer("ws://gateway/ws", dialer),
            ssh: Arc::new(NoSsh),
            policy: ReconnectPolicy::default(),
            events,
        });
        let err = run_macro(&handle, &boot_macro(0), "\r\n").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn stored_macro_is_touched_after_running() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(tmp.path().join("fluxterm_macros.json")).unwrap();
        store
            .save_macro("probe", vec!["uname -a".to_string()], 0, None)
            .unwrap();

        let (handle, _events, mut peer) = connected_session().await;
        let count = run_stored_macro(&handle, &mut store, "probe", "\n")
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(next_data(&mut peer).await, b"uname -a\n");
        assert!(store.find("probe").unwrap().last_used.is_some());

        assert!(matches!(
            run_stored_macro(&handle, &mut store, "missing", "\n").await,
            Err(MacroError::UnknownMacro(_))
        ));
    }
}
