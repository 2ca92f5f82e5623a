use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::{Engine, Topic};

#[derive(Clone)]
pub struct WsState {
    pub engine: Arc<Engine>,
}

/// Client subscription message
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    /// Subscribe to a topic: "route:<id>" or "stop:<id>"
    Subscribe { topic: String },
    /// Drop a previously added subscription
    Unsubscribe { topic: String },
}

/// Control messages sent to clients; engine events (position, eta,
/// bus_status) are serialized onto the same stream with their own type tags.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    /// Initial connection acknowledgment
    Connected { message: String },
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    /// Error message
    Error { message: String },
}

/// WebSocket endpoint for real-time position and ETA updates
pub async fn ws_events(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let hub = state.engine.hub();
    let (client_id, mut events) = hub.register().await;

    // Send connected message
    let connected = ServerMessage::Connected {
        message: "Connected. Send {\"type\":\"subscribe\",\"topic\":\"route:<id>\"} or \"stop:<id>\"."
            .to_string(),
    };
    if let Ok(json) = serde_json::to_string(&connected) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Channel to pass acks from the receive loop to the sender task
    let (ack_tx, mut ack_rx) = tokio::sync::mpsc::channel::<ServerMessage>(16);

    // Spawn task to forward hub events to the WebSocket
    let forward_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(ack) = ack_rx.recv() => {
                    if let Ok(json) = serde_json::to_string(&ack) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    // Handle incoming messages from the client
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { topic }) => match topic.parse::<Topic>() {
                    Ok(parsed) => {
                        hub.subscribe(client_id, parsed).await;
                        let _ = ack_tx.send(ServerMessage::Subscribed { topic }).await;
                    }
                    Err(e) => {
                        let _ = ack_tx
                            .send(ServerMessage::Error {
                                message: e.to_string(),
                            })
                            .await;
                    }
                },
                Ok(ClientMessage::Unsubscribe { topic }) => match topic.parse::<Topic>() {
                    Ok(parsed) => {
                        hub.unsubscribe(client_id, parsed).await;
                        let _ = ack_tx.send(ServerMessage::Unsubscribed { topic }).await;
                    }
                    Err(e) => {
                        let _ = ack_tx
                            .send(ServerMessage::Error {
                                message: e.to_string(),
                            })
                            .await;
                    }
                },
                Err(_) => {
                    let _ = ack_tx
                        .send(ServerMessage::Error {
                            message: "unrecognized message".to_string(),
                        })
                        .await;
                }
            },
            Ok(Message::Ping(_)) => {
                // Axum handles pong automatically
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // Cleanup: drop subscriptions promptly so publishes stop queueing
    hub.unregister(client_id).await;
    forward_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","topic":"stop:102"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { ref topic } if topic == "stop:102"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"unsubscribe","topic":"route:7"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unsubscribe { ref topic } if topic == "route:7"));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"noise"}"#).is_err());
    }

    #[test]
    fn server_messages_carry_type_tag() {
        let json = serde_json::to_string(&ServerMessage::Subscribed {
            topic: "stop:102".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"subscribed\""));
    }
}
