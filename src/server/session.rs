//! Per-connection session handling.
//!
//! Each WebSocket connection owns one [`TrainingCoordinator`] and one event
//! pump. The training worker publishes through a queue handoff; only the
//! pump below ever writes to the socket, so worker threads never touch the
//! connection. Queue order is delivery order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventSink, QueueSink, Update};
use crate::training::{TrainingCoordinator, TrainingRequest};

use super::SessionConfig;

/// An inbound client event frame.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(config): State<SessionConfig>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, config))
}

async fn handle_socket(socket: WebSocket, config: SessionConfig) {
    let sid = Uuid::new_v4();
    info!(%sid, "Client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = unbounded_channel();
    let sink: Arc<QueueSink> = Arc::new(QueueSink::new(tx));
    let mut coordinator = TrainingCoordinator::new(sink.clone(), config.options.clone());

    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                let payload = json!({ "event": "update", "data": update });
                if ws_tx.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &mut coordinator, sink.as_ref(), sid);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary frames need no handling
                    Some(Err(err)) => {
                        warn!(%sid, error = %err, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!(%sid, phase = ?coordinator.phase(), "Client disconnected");
    // Dropping the coordinator requests cancellation and joins the worker,
    // so no events are published for this session afterwards.
}

fn handle_client_message(
    text: &str,
    coordinator: &mut TrainingCoordinator,
    sink: &dyn EventSink,
    sid: Uuid,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(%sid, error = %err, "Unparseable client frame");
            return;
        }
    };

    match message.event.as_str() {
        "start_training" => match serde_json::from_value::<TrainingRequest>(message.data) {
            Ok(request) => {
                info!(%sid, "Training requested");
                coordinator.start(request);
            }
            Err(err) => {
                warn!(%sid, error = %err, "Malformed training request");
                sink.emit(Update::failed(format!(
                    "Error: invalid training request: {err}"
                )));
            }
        },
        "stop_training" => {
            info!(%sid, "Stop requested");
            coordinator.stop();
        }
        other => warn!(%sid, event = other, "Unknown client event"),
    }
}
