//! WebSocket progress channel
//!
//! GET /ws/{client_id}. The client id is stable across reconnects; the
//! registry restores its subscriptions when the same id attaches again.
//!
//! Server → client: `connected` / `reconnected` notices, `ping` probes, and
//! `progress` / `complete` / `error` batch events.
//! Client → server: `pong`, `heartbeat`, `subscribe {batch_id}`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, StreamExt};
use lbo_common::events::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::AppState;

/// GET /ws/{client_id}
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, state))
}

async fn handle_socket(socket: WebSocket, client_id: String, state: AppState) {
    let config = state.registry.config().clone();
    let (tx, mut outbound) = mpsc::channel::<ServerMessage>(config.outbound_buffer);

    let connection = state.registry.register(&client_id, tx).await;
    state.broadcaster.on_connect(&connection).await;

    let (mut sink, mut incoming) = socket.split();

    let mut ping = tokio::time::interval(config.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if !send_json(&mut sink, &message).await {
                        break;
                    }
                }
                // Registry dropped the transport (liveness expiry or replacement)
                None => {
                    debug!(client_id = %client_id, "Transport detached by registry");
                    break;
                }
            },
            _ = ping.tick() => {
                if !send_json(&mut sink, &ServerMessage::ping()).await {
                    break;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&state, &client_id, &text).await;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    state.registry.heartbeat(&client_id).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!(client_id = %client_id, "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(client_id = %client_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    }

    state
        .registry
        .unregister(&client_id, connection.connection_id)
        .await;
    let _ = sink.close().await;
}

/// Serialize and send; false once the socket is unusable
async fn send_json<S>(sink: &mut S, message: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize server message");
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}

async fn handle_client_text(state: &AppState, client_id: &str, text: &str) {
    match ClientMessage::parse(text) {
        Some(ClientMessage::Pong) => {
            state.registry.pong(client_id).await;
        }
        Some(ClientMessage::Heartbeat) => {
            state.registry.heartbeat(client_id).await;
        }
        Some(ClientMessage::Subscribe { batch_id }) => {
            let subscribed = state.orchestrator.subscribe(client_id, &batch_id).await;
            let replayed = match subscribed {
                Ok(()) => state.broadcaster.replay(client_id, &batch_id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = replayed {
                warn!(client_id = %client_id, batch_id = %batch_id, error = %e, "Subscribe rejected");
            }
        }
        None => {
            debug!(client_id = %client_id, "Unrecognized client message");
        }
    }
}

/// Build WebSocket routes
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws/:client_id", get(ws_handler))
}
