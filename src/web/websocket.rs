use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::collect::JobManager;

pub fn routes() -> Router<JobManager> {
    Router::new().route("/", get(websocket_handler))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(manager): State<JobManager>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, manager))
}

/// Sends a snapshot, then every property change as it happens
async fn handle_socket(socket: WebSocket, manager: JobManager) {
    let (mut sender, mut receiver) = socket.split();
    let mut changes = manager.results().subscribe();

    let msg = json!({
        "type": "status",
        "data": manager.results().snapshot()
    });
    if let Err(e) = sender.send(Message::Text(msg.to_string())).await {
        error!("Failed to send initial status: {}", e);
        return;
    }

    let results = manager.results().clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = match changes.recv().await {
                Ok(change) => json!({
                    "type": "propertyChange",
                    "data": change
                }),
                // Slow client: skip ahead and resync from a snapshot
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged by {} changes", skipped);
                    json!({
                        "type": "status",
                        "data": results.snapshot()
                    })
                }
                Err(RecvError::Closed) => break,
            };

            if sender.send(Message::Text(msg.to_string())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    debug!("Received WebSocket message: {}", text);
                }
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    debug!("WebSocket connection closed");
}
