//! WebSocket server: accept loop and per-client task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Upgrading each accepted connection to a WebSocket session.
//! 3. Registering the session with the gateway under a fresh [`ClientId`].
//! 4. Running two concurrent tasks per session:
//!    - **Reader**: forwards text frames to the gateway as raw JSON.
//!    - **Writer**: drains the client's outbox and sends each
//!      [`ServerMessage`] as a `{command, data}` text frame.
//! 5. Stopping the accept loop once the `running` flag is cleared.
//!
//! The reader never parses JSON itself; malformed input is the gateway's
//! call, so a bad frame never closes the socket.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::{ClientId, GatewayHandle};
use crate::domain::{GatewayConfig, ServerMessage};

/// How long one `accept` waits before the loop re-checks `running`.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.bind_addr` and serves clients until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound (port in use, no
/// permission, ...).
pub async fn run_server(
    config: &GatewayConfig,
    gateway: GatewayHandle,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", config.bind_addr))?;

    info!("ATV gateway listening on ws://{}", config.bind_addr);
    serve(listener, gateway, running).await;
    Ok(())
}

/// Runs the accept loop on an already-bound listener.
///
/// Each accepted connection gets its own task, so one slow client never
/// holds up the others.
pub async fn serve(listener: TcpListener, gateway: GatewayHandle, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Bounded wait so the flag is re-checked even when nobody connects.
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                info!("new client connection from {peer_addr}");
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    handle_client_session(stream, peer_addr, gateway).await;
                });
            }
            Ok(Err(e)) => {
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

/// Entry point of each per-client task; logs how the session ended.
async fn handle_client_session(stream: TcpStream, peer_addr: SocketAddr, gateway: GatewayHandle) {
    match run_session(stream, peer_addr, gateway).await {
        Ok(()) => info!("session {peer_addr} closed normally"),
        Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
    }
}

/// Runs the complete lifecycle of one client WebSocket session.
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails.
async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gateway: GatewayHandle,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    let client: ClientId = Uuid::new_v4();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<ServerMessage>();
    if !gateway.attach(client, outbox) {
        debug!("session {peer_addr}: gateway stopped before attach");
        return Ok(());
    }
    info!("session {peer_addr} established as client {client}");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // ── Writer: outbox → socket ───────────────────────────────────────────────
    //
    // Ends when the gateway drops the outbox (client removed or gateway
    // stopped) or the socket refuses a write.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            let text = match serde_json::to_string(&message.to_envelope()) {
                Ok(text) => text,
                Err(e) => {
                    error!("client {client}: failed to serialise {}: {e}", message.command());
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                debug!("client {client}: WebSocket send failed (peer gone)");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // ── Reader: socket → gateway ──────────────────────────────────────────────
    let reader_gateway = gateway.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            let frame = match ws_rx.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                    debug!("client {client}: WebSocket closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!("client {client}: WebSocket error: {e}");
                    break;
                }
                None => {
                    debug!("client {client}: stream ended");
                    break;
                }
            };

            match frame {
                WsMessage::Text(text) => {
                    if !reader_gateway.message(client, text) {
                        debug!("client {client}: gateway stopped");
                        break;
                    }
                }
                WsMessage::Binary(_) => {
                    warn!("client {client}: unexpected binary frame (ignored)");
                }
                WsMessage::Close(_) => {
                    debug!("client {client}: Close frame received");
                    break;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    });

    // Whichever half finishes first ends the session.
    tokio::select! {
        _ = &mut writer => {
            debug!("client {client}: writer task ended");
            reader.abort();
        }
        _ = &mut reader => {
            debug!("client {client}: reader task ended");
            writer.abort();
        }
    }

    gateway.detach(client);
    Ok(())
}
