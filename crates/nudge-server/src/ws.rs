use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use libnudge::{AuthContext, Connection};
use nudge_protocol::{ClientMessage, WireEvent};

use crate::AppState;
use crate::auth::Caller;

/// GET /ws/notifications - Upgrade an authenticated request to a push channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, ctx))
}

/// Handle a single WebSocket connection.
///
/// - The registry pushes serialized frames into this connection's queue.
/// - This task drains the queue into the socket and answers control messages.
/// - When the registry drops the connection its token fires and the socket closes.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, ctx: AuthContext) {
    let principal_id = ctx.principal.id;
    let (conn, mut frames) = Connection::new(state.config.connection_buffer);
    let conn_id = conn.id();
    let closed = conn.closed_token();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Registered before the ack so nothing sent after the client sees it is lost.
    state.registry.register(principal_id, conn);
    let ack = WireEvent::connection_ack(principal_id, &ctx.principal.username);
    if send_event(&mut ws_tx, &ack).await.is_err() {
        state.registry.unregister(principal_id, conn_id);
        return;
    }

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!(principal_id, %conn_id, "connection dropped by registry");
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let written = ws_tx.send(Message::text(frame.text().to_string())).await.is_ok();
                frame.ack(written);
                if !written {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        debug!(principal_id, "ws read error: {e}");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        let reply = control_reply(text.as_str());
                        if send_event(&mut ws_tx, &reply).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.registry.unregister(principal_id, conn_id);
    // Frames still queued are dropped here, which fails their acknowledgements.
    drop(frames);
    info!(principal_id, %conn_id, "websocket closed");
}

/// Answer one inbound text frame.
///
/// `mark_read` is acknowledged only; read state changes through the HTTP API.
fn control_reply(text: &str) -> WireEvent {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping { timestamp }) => WireEvent::pong(timestamp),
        Ok(ClientMessage::MarkRead { notification_id }) => WireEvent::mark_read_ack(notification_id),
        Err(e) => {
            warn!("invalid client message: {e}");
            WireEvent::error(format!("invalid message: {e}"))
        }
    }
}

async fn send_event(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    event: &WireEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    ws_tx.send(Message::text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_protocol::EventKind;

    #[test]
    fn ping_is_echoed_as_pong() {
        let reply = control_reply(r#"{"type":"ping","timestamp":123}"#);
        assert_eq!(reply.kind, EventKind::Pong);
        assert_eq!(reply.data["timestamp"], 123);
    }

    #[test]
    fn mark_read_is_acknowledged() {
        let reply = control_reply(r#"{"type":"mark_read","notification_id":5}"#);
        assert_eq!(reply.kind, EventKind::MarkReadAck);
        assert_eq!(reply.data["notification_id"], 5);
        assert_eq!(reply.data["success"], true);
    }

    #[test]
    fn garbage_gets_an_error_event() {
        for text in ["not json", r#"{"type":"subscribe"}"#, r#"{"type":"mark_read"}"#] {
            assert_eq!(control_reply(text).kind, EventKind::Error);
        }
    }
}
