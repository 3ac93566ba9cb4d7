//! WebSocket endpoint binding registry connections to sockets.
//!
//! Each upgraded socket gets a registry [`Connection`]. The handler task
//! reads client frames and dispatches them; a writer task forwards direct
//! frames (replies, flow signals) and drains the outbound queue in
//! batches.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::protocol::ServerMessage;
use super::registry::{Connection, ConnectionRegistry};
use crate::{AppError, Result};

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<ConnectionRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

/// Router exposing `/ws` and `/health`.
pub fn router(registry: Arc<ConnectionRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(registry)
}

/// Serve the transport on `listener` until `cancel` fires, then close
/// every connection.
///
/// # Errors
///
/// Returns `AppError::Transport` if the HTTP server fails.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Transport(format!("listener has no address: {err}")))?;
    info!(%local, "starting websocket transport");

    let on_shutdown = Arc::clone(&registry);
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            on_shutdown.shutdown();
        })
        .await
        .map_err(|err| AppError::Transport(format!("websocket server error: {err}")))?;

    info!("websocket transport shut down");
    Ok(())
}

async fn handle_socket(socket: WebSocket, registry: Arc<ConnectionRegistry>) {
    let (tx, rx) = mpsc::channel(registry.config().outbound_buffer.max(1));
    let connection = registry.open(tx);
    let span = info_span!("ws_connection", connection_id = %connection.id());

    let (sender, mut receiver) = socket.split();
    let batch = registry.config().drain_batch.max(1);
    let mut writer = tokio::spawn(
        write_loop(Arc::clone(&connection), sender, rx, batch).instrument(span.clone()),
    );

    async {
        loop {
            tokio::select! {
                () = connection.cancel_token().cancelled() => break,
                _ = &mut writer => {
                    debug!("writer finished");
                    break;
                }
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        registry.handle_frame(&connection, text.as_str().as_bytes());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        registry.handle_frame(&connection, &data);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("client closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "websocket receive error");
                        break;
                    }
                },
            }
        }
    }
    .instrument(span)
    .await;

    registry.close(connection.id());
}

async fn write_loop(
    connection: Arc<Connection>,
    mut sender: SplitSink<WebSocket, Message>,
    mut direct: mpsc::Receiver<ServerMessage>,
    batch: usize,
) {
    loop {
        tokio::select! {
            () = connection.cancel_token().cancelled() => break,
            frame = direct.recv() => {
                let Some(frame) = frame else { break };
                if send(&mut sender, &frame).await.is_err() {
                    break;
                }
            }
            () = connection.notified() => {
                if !flush_queue(&connection, &mut sender, batch).await {
                    break;
                }
            }
        }
    }

    if let Err(err) = sender.close().await {
        debug!(%err, "socket close failed");
    }
}

/// Drain the outbound queue until empty. Returns `false` once the socket
/// stops accepting frames.
async fn flush_queue(
    connection: &Connection,
    sender: &mut SplitSink<WebSocket, Message>,
    batch: usize,
) -> bool {
    loop {
        let messages = connection.drain(batch);
        if messages.is_empty() {
            return true;
        }
        for message in &messages {
            if send(sender, message).await.is_err() {
                return false;
            }
        }
    }
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> std::result::Result<(), axum::Error> {
    sender
        .send(Message::Text(message.to_json().into()))
        .await
        .inspect_err(|err| debug!(%err, "websocket send failed"))
}
