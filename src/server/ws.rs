use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use super::AppState;
use crate::session::{ServerMessage, Transport};

/// Outbound half of an observer WebSocket
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: ServerMessage) -> Result<()> {
        let text = serde_json::to_string(&message)?;
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: AppState, socket: WebSocket) {
    let (sink, mut receiver) = socket.split();
    let id = state.sessions.on_connect(WsTransport { sink });

    // Observers only listen; drain inbound frames until the peer goes away.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Text(text)) => {
                debug!(session_id = %id, len = text.as_str().len(), "ignoring observer text frame");
            }
            Ok(_) => {}
        }
    }

    state.sessions.on_disconnect(&id);
}
