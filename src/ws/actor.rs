use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::auth::Principal;
use crate::state::AppState;
use crate::ws::lifecycle::{self, ConnectMeta, CLOSE_GOING_AWAY};
use crate::ws::protocol;
use crate::ws::registry::Outbound;

/// Pong timeout: if no pong arrives within 10 seconds after a ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one authenticated socket until it closes.
///
/// The socket is split in two:
/// - Writer task: owns the sink and drains the connection's outbound queue
/// - Reader loop: refreshes the heartbeat and dispatches inbound frames
///
/// A third task pings on an interval and closes the socket when pongs stop.
pub async fn run_connection(socket: WebSocket, state: AppState, principal: Principal, meta: ConnectMeta) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    // The writer must be draining before connect replays the unread backlog.
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let entry = lifecycle::connect(&state, &principal, tx.clone(), meta).await;
    let connection_id = entry.connection_id.clone();

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    let ping_tx = tx.clone();
    let ping_every = Duration::from_secs(state.config.presence.ping_interval_secs.max(1));
    let ping_connection = connection_id.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(ping_every);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Outbound::Ping(Bytes::from_static(b"beat"))).is_err() {
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!(connection_id = %ping_connection, "Pong timeout, closing connection");
                    let _ = ping_tx.send(Outbound::Close {
                        code: CLOSE_GOING_AWAY,
                        reason: "Pong timeout".to_string(),
                    });
                    break;
                }
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = tx.send(Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "Server shutting down".to_string(),
                });
                break;
            }
            next = ws_receiver.next() => next,
        };
        match next {
            Some(Ok(msg)) => {
                state.registry.heartbeat(&connection_id);
                match msg {
                    Message::Text(text) => {
                        protocol::handle_text_message(text.as_str(), &state, &connection_id, &principal)
                            .await;
                    }
                    Message::Binary(_) => {
                        let _ = tx.send(Outbound::Event(protocol::ServerEvent::error(
                            400,
                            "binary frames are not supported",
                        )));
                    }
                    Message::Pong(_) => {
                        let _ = pong_tx.send(());
                    }
                    Message::Ping(data) => {
                        let _ = tx.send(Outbound::Pong(data));
                    }
                    Message::Close(frame) => {
                        tracing::info!(
                            connection_id = %connection_id,
                            reason = ?frame,
                            "Client initiated close"
                        );
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(connection_id = %connection_id, "WebSocket stream ended");
                break;
            }
        }
    }

    ping_handle.abort();
    lifecycle::disconnect(&state, &connection_id);
    // Dropping the last sender lets the writer flush what is queued and exit.
    drop(tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer_handle).await;
}

/// Drain the outbound queue into the socket. Stops on the first send error
/// or after writing a close frame.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = rx.recv().await {
        let (msg, closing) = match frame {
            Outbound::Event(event) => match protocol::encode(&event) {
                Ok(text) => (Message::Text(text.into()), false),
                Err(e) => {
                    tracing::error!(event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            },
            Outbound::Ping(data) => (Message::Ping(data), false),
            Outbound::Pong(data) => (Message::Pong(data), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
