use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result};
use flux_client::store::MACROS_KEY;
use flux_client::{
    ConnectionState, GatewayApi, MacroStore, SessionError, SessionEventKind, SessionHandle,
    SessionRegistry, TransportClient, run_stored_macro,
};
use flux_protocol::ConnectionConfig;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::terminal::{Console, terminal_size};
use super::{AfterConnectArgs, Context};

const DETACH_BYTE: u8 = 0x1D; // Ctrl-]

pub struct AttachOptions {
    pub config: ConnectionConfig,
    pub auto_reconnect: bool,
    pub after: AfterConnectArgs,
}

/// How an attach session ended.
pub enum AttachOutcome {
    /// User pressed Ctrl-].
    Detached,
    /// The session settled in `Disconnected`; carries the last status line.
    Closed(String),
}

/// Open one session through the gateway and wire it to this terminal.
pub async fn attach(ctx: &Context, opts: AttachOptions) -> Result<AttachOutcome> {
    let transport = TransportClient::new(ctx.config.gateway.ws_url.clone());
    let api = Arc::new(GatewayApi::new(&ctx.config.gateway)?);
    let mut registry = SessionRegistry::new(transport.clone(), api, ctx.config.reconnect);
    let mut events = registry.subscribe();
    let session_id = registry.active_session_id().to_string();

    let mut config = opts.config;
    if let ConnectionConfig::Ssh(ssh) = &mut config {
        if let Ok((cols, rows)) = terminal_size() {
            ssh.cols = Some(cols);
            ssh.rows = Some(rows);
        }
    }
    let label = config.label();
    info!(session = %session_id, target = %label, "attaching");

    registry
        .connect(&session_id, config, opts.auto_reconnect)
        .await
        .with_context(|| format!("Cannot connect to {label}"))?;

    let result = attach_session(ctx, &mut registry, &session_id, &mut events, &label, opts.after).await;

    registry.shutdown().await;
    transport.disconnect();
    result
}

async fn attach_session(
    ctx: &Context,
    registry: &mut SessionRegistry,
    session_id: &str,
    events: &mut broadcast::Receiver<flux_client::SessionEvent>,
    label: &str,
    after: AfterConnectArgs,
) -> Result<AttachOutcome> {
    let handle = registry
        .handle(session_id)
        .cloned()
        .context("session vanished before attach")?;

    let mut console = Console::attach();
    console.notice(&format!("connecting to {label} -- Ctrl-] to detach"));

    #[cfg(unix)]
    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    // Blocking stdin reader; polls so it notices shutdown.
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    let stdin_shutdown = Arc::new(AtomicBool::new(false));
    let stdin_shutdown_thread = stdin_shutdown.clone();
    std::thread::spawn(move || {
        use std::io::Read;
        use std::os::fd::AsRawFd;
        let stdin = std::io::stdin();
        let stdin_fd = stdin.as_raw_fd();
        let mut buf = [0u8; 4096];
        loop {
            if stdin_shutdown_thread.load(Ordering::Relaxed) {
                break;
            }
            let mut pfd = nix::libc::pollfd {
                fd: stdin_fd,
                events: nix::libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { nix::libc::poll(&mut pfd, 1, 100) };
            if ret <= 0 {
                continue;
            }
            let mut locked = stdin.lock();
            match locked.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    drop(locked);
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut after = Some(after);
    let outcome = loop {
        tokio::select! {
            Some(data) = stdin_rx.recv() => {
                let (input, detach) = match data.iter().position(|&b| b == DETACH_BYTE) {
                    Some(pos) => (&data[..pos], true),
                    None => (&data[..], false),
                };
                if !input.is_empty() {
                    forward_input(&handle, input).await;
                }
                if detach {
                    break AttachOutcome::Detached;
                }
            }

            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // dropped events may include a state change
                        warn!(skipped, "session events lagged, resyncing");
                        registry.resync().await;
                        match registry.get(session_id).map(|r| (r.state, r.status.clone())) {
                            Some((ConnectionState::Disconnected, status)) => {
                                break AttachOutcome::Closed(status);
                            }
                            Some((ConnectionState::Connected, _)) => {
                                if let Some(after) = after.take() {
                                    run_after_connect(ctx, &handle, after);
                                }
                            }
                            _ => {}
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break AttachOutcome::Closed("session ended".to_string());
                    }
                };
                if event.session_id != session_id {
                    continue;
                }
                registry.apply(&event);

                match &event.kind {
                    SessionEventKind::Output(bytes) => console.write(bytes),
                    SessionEventKind::Status(status) => console.notice(status),
                    SessionEventKind::StateChanged(ConnectionState::Connected) => {
                        if let Ok((cols, rows)) = terminal_size() {
                            let _ = handle.resize(cols, rows).await;
                        }
                        if let Some(after) = after.take() {
                            run_after_connect(ctx, &handle, after);
                        }
                    }
                    SessionEventKind::StateChanged(ConnectionState::Disconnected) => {
                        let status = registry
                            .get(session_id)
                            .map(|r| r.status.clone())
                            .unwrap_or_default();
                        break AttachOutcome::Closed(status);
                    }
                    _ => {}
                }
            }

            _ = sigwinch.recv() => {
                if let Ok((cols, rows)) = terminal_size() {
                    debug!(cols, rows, "terminal resized");
                    let _ = handle.resize(cols, rows).await;
                }
            }
        }
    };

    stdin_shutdown.store(true, Ordering::Relaxed);
    if matches!(outcome, AttachOutcome::Detached) {
        if let Err(e) = handle.disconnect().await {
            debug!(error = %e, "disconnect on detach");
        }
    }
    drop(console);
    Ok(outcome)
}

async fn forward_input(handle: &SessionHandle, input: &[u8]) {
    match handle.send_input(input).await {
        Ok(()) => {}
        // keystrokes while connecting or reconnecting are dropped
        Err(SessionError::NotConnected) => {}
        Err(e) => warn!(error = %e, "failed to forward input"),
    }
}

/// `--run-macro` / `--send-file`, started once on the first connect.
fn run_after_connect(ctx: &Context, handle: &SessionHandle, after: AfterConnectArgs) {
    if let Some(path) = after.send_file {
        let handle = handle.clone();
        let protocol = after.protocol;
        tokio::spawn(async move {
            if let Err(e) = handle.send_file(&path, &protocol).await {
                warn!(file = %path.display(), error = %e, "file send failed");
                let _ = handle.set_status(format!("Cannot send file: {e}")).await;
            }
        });
    }

    if let Some(name) = after.run_macro {
        let handle = handle.clone();
        let store_path = ctx.paths.store_path(MACROS_KEY);
        let line_ending = ctx.config.line_ending.clone();
        tokio::spawn(async move {
            let result = match MacroStore::open(&store_path) {
                Ok(mut store) => run_stored_macro(&handle, &mut store, &name, &line_ending)
                    .await
                    .map_err(anyhow::Error::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(name = %name, error = %e, "macro did not run");
                let _ = handle.set_status(format!("Macro failed: {e}")).await;
            }
        });
    }
}
