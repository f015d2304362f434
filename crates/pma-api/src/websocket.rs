//! WebSocket push channel
//!
//! Each connection subscribes to the hub and forwards events as JSON
//! text frames. The hub's broadcast ring bounds the backlog per
//! subscriber; when a connection falls behind it receives a single
//! `lagged` notice. Connections that send nothing (not even a ping) for
//! 60 s are reaped.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::AppState;

/// Close connections with no inbound frame for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.hub.subscribe();
    info!("WebSocket subscriber connected");

    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    break;
                };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize push event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Any inbound frame counts as liveness
                        idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            _ = &mut idle => {
                debug!("Closing idle WebSocket subscriber");
                break;
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    info!("WebSocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use pma_events::{EventKind, HeartbeatEvent, PushEvent};

    #[test]
    fn test_wire_frame_shape() {
        let event = PushEvent::new(
            EventKind::Heartbeat,
            HeartbeatEvent {
                server_time: chrono::Utc::now(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value["data"]["server_time"].is_string());
        assert!(value["timestamp"].is_string());
    }
}
