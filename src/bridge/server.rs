//! WebSocket server for browser terminals
//!
//! Each accepted socket becomes one terminal transport. Text frames carry
//! JSON events (`{"event": "...", "data": ...}`) in both directions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::terminal::{ClientEvent, ServerEvent, TerminalProxy};

/// WebSocket accept timeout (seconds)
const WS_ACCEPT_TIMEOUT_SECS: u64 = 10;
/// A client that cannot take a frame within this window is dropped
const WS_SEND_TIMEOUT_SECS: u64 = 5;
/// Time allowed for queued events to flush after the session ends
const WS_DRAIN_TIMEOUT_SECS: u64 = 5;

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Outgoing capacity is larger: shell output arrives in bursts
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, terminal: Arc<TerminalProxy>) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    info!("Terminal WebSocket server listening on {}", local);

    loop {
        let (stream, peer) = listener.accept().await?;
        let terminal = terminal.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, terminal).await {
                warn!("WebSocket connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

/// Decode one text frame; malformed events are logged and dropped
pub fn parse_client_event(text: &str) -> Option<ClientEvent> {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Ignoring malformed client event ({} bytes): {}", text.len(), e);
            None
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    terminal: Arc<TerminalProxy>,
) -> Result<(), String> {
    let ws_stream = tokio::time::timeout(
        Duration::from_secs(WS_ACCEPT_TIMEOUT_SECS),
        accept_async(stream),
    )
    .await
    .map_err(|_| "WebSocket handshake timeout".to_string())?
    .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    debug!("WebSocket handshake completed for {}", peer);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(EVENT_CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(OUTPUT_CHANNEL_CAPACITY);

    // Task: ServerEvent -> WebSocket
    let sender_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode server event: {}", e);
                    continue;
                }
            };

            match tokio::time::timeout(
                Duration::from_secs(WS_SEND_TIMEOUT_SECS),
                ws_sender.send(Message::Text(text)),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("WebSocket send failed: {:?}", e);
                    return;
                }
                Err(_) => {
                    warn!(
                        "WebSocket send timeout after {}s - client unresponsive, disconnecting",
                        WS_SEND_TIMEOUT_SECS
                    );
                    return;
                }
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        debug!("WebSocket sender task stopped");
    });

    // Task: WebSocket -> ClientEvent. Returning drops `event_tx`, which the
    // terminal proxy treats as the transport going away.
    let reader_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("WebSocket close frame received");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                }
            };

            if let Some(event) = parse_client_event(&text) {
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
        debug!("WebSocket reader task stopped");
    });

    let peer_label = peer.to_string();
    terminal.serve(&peer_label, event_rx, out_tx).await;

    reader_task.abort();
    if tokio::time::timeout(Duration::from_secs(WS_DRAIN_TIMEOUT_SECS), sender_task)
        .await
        .is_err()
    {
        debug!("WebSocket sender for {} did not drain in time", peer);
    }

    Ok(())
}
