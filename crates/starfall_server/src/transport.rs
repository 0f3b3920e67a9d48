//! WebSocket transport adapter.
//!
//! Each client connection gets one task running two halves: the reader
//! parses text frames into [`InboundEvent`]s and forwards them to the world
//! loop, the writer drains the connection's outbound queue into the socket.
//! Whichever half finishes first ends the connection, after which the world
//! loop is told the client is gone.

use crate::error::ServerError;
use crate::runtime::{Outbound, WorldHandle};
use futures::{SinkExt, StreamExt};
use starfall_core::{InboundEvent, ShutdownState};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, trace};

/// Handles a single client connection from handshake to cleanup.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    world: WorldHandle,
    shutdown: ShutdownState,
) -> Result<(), ServerError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ServerError::Network(format!("WebSocket handshake failed: {e}")))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (conn, mut outbound) = world.connect(addr.ip()).await?;
    debug!("🔗 Connection {} established from {}", conn, addr);

    let incoming = {
        let world = world.clone();
        async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let forwarded = match InboundEvent::parse(text.as_str()) {
                            Ok(event) => world.send(conn, event).await,
                            Err(e) => world.malformed(conn, e.to_string()).await,
                        };
                        if forwarded.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        if world.malformed(conn, "binary frames are not supported").await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("🔌 Client {} requested close", conn);
                        break;
                    }
                    // pings are answered by tungstenite on the next read
                    Ok(_) => {}
                    Err(e) => {
                        debug!("WebSocket error for connection {}: {}", conn, e);
                        break;
                    }
                }
            }
        }
    };

    let outgoing = async move {
        while let Some(message) = outbound.recv().await {
            match message {
                Outbound::Event(event) => {
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode {} for {}: {}", event.kind(), conn, e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        debug!("Failed to send to {}: {}", conn, e);
                        return;
                    }
                }
                Outbound::Close(reason) => {
                    trace!("Closing connection {}: {}", conn, reason);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        // queue closed or dropped for being slow
        let _ = ws_sender.close().await;
    };

    tokio::select! {
        _ = incoming => {},
        _ = outgoing => {},
        _ = shutdown.wait() => {
            debug!("🛑 Closing connection {} for shutdown", conn);
        }
    }

    // the loop may already be gone during shutdown
    let _ = world.disconnect(conn).await;
    debug!("🔌 Connection {} closed", conn);
    Ok(())
}
