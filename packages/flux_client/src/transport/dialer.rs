use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::debug;

use crate::error::TransportError;

/// An established socket, reduced to two text channels.
///
/// Dropping `outbound` closes the socket. `inbound` yields `None` once the
/// peer closes or the connection fails.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens the physical connection to the gateway.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// WebSocket dialer used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsDialer;

impl Dialer for WsDialer {
    fn dial(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(TransportError::from_tungstenite)?;
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                        debug!("gateway write failed: {}", e);
                        break;
                    }
                }
                let _ = ws_write.close().await;
            });

            tokio::spawn(async move {
                while let Some(frame) = ws_read.next().await {
                    match frame {
                        Ok(tungstenite::Message::Text(text)) => {
                            if in_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Ok(tungstenite::Message::Close(_)) => break,
                        // ping/pong are answered by tungstenite; the gateway never sends binary
                        Ok(_) => {}
                        Err(e) => {
                            debug!("gateway read failed: {}", e);
                            break;
                        }
                    }
                }
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
