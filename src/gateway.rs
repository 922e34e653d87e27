//! WebSocket gateway.
//!
//! Owns the listener and one reader/writer task pair per viewer. The
//! gateway holds no broadcast state: everything inbound is forwarded to
//! the engine as an [`EngineEvent`], and everything outbound arrives on
//! the session's payload channel. A slow or dead viewer therefore only
//! ever backs up its own writer task.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::engine::{EngineEvent, SessionHandle, SessionPayload};

/// Pause after a failed accept before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept viewer connections until the listener fails permanently or the
/// engine goes away.
pub async fn run(listener: TcpListener, engine_tx: UnboundedSender<EngineEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let engine_tx = engine_tx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, addr, engine_tx).await;
                });
            }
            Err(e) => {
                // Transient errors (EMFILE, ECONNABORTED) resolve themselves;
                // back off briefly instead of spinning.
                log::warn!("[gateway] accept failed: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Serve one viewer: handshake, register with the engine, then pump
/// frames both ways until either side closes.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine_tx: UnboundedSender<EngineEvent>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("[gateway] handshake with {addr} failed: {e}");
            return;
        }
    };

    let id = Uuid::new_v4();
    log::debug!("[gateway] viewer {id} connected from {addr}");

    let (mut sink, mut source) = ws.split();
    let (payload_tx, mut payload_rx) = mpsc::unbounded_channel::<SessionPayload>();
    if engine_tx
        .send(EngineEvent::ViewerConnected {
            id,
            handle: SessionHandle::new(payload_tx),
        })
        .is_err()
    {
        // Engine already shut down; nothing to serve.
        return;
    }

    // Writer: drains the session channel into the socket. Ends when the
    // engine drops the handle or the socket dies.
    let writer = tokio::spawn(async move {
        while let Some(payload) = payload_rx.recv().await {
            let outcome = match payload {
                SessionPayload::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => sink.send(Message::Text(json)).await,
                    Err(e) => {
                        log::error!("[gateway] failed to serialize event: {e}");
                        continue;
                    }
                },
                SessionPayload::Probe => sink.send(Message::Ping(Vec::new())).await,
                SessionPayload::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if outcome.is_err() {
                break;
            }
        }
    });

    // Reader: forwards inbound frames to the engine until close or error.
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(raw)) => {
                if engine_tx
                    .send(EngineEvent::ViewerMessage { id, raw })
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Pong(_)) => {
                let _ = engine_tx.send(EngineEvent::ViewerPong { id });
            }
            Ok(Message::Close(_)) => break,
            // Pings are answered by the protocol layer; binary is not
            // part of the viewer protocol.
            Ok(_) => {}
            Err(e) => {
                log::debug!("[gateway] viewer {id} read error: {e}");
                break;
            }
        }
    }

    let _ = engine_tx.send(EngineEvent::ViewerDisconnected { id });
    writer.abort();
    log::debug!("[gateway] viewer {id} reader finished");
}
