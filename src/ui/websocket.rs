//! WebSocket event stream
//!
//! Clients receive every [`UiEvent`] as a JSON text frame, starting with the
//! current playback snapshot. Text frames sent by a client are parsed as
//! playback commands.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::playback::RemoteCommand;
use crate::ui::server::{AppState, UiEvent};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.subscribe();

    if let Some(snapshot) = state.latest_playback() {
        if let Some(text) = encode(&UiEvent::Playback { snapshot }) {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(text) = encode(&event) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "WebSocket client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let command_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    let command = serde_json::from_str::<serde_json::Value>(&text)
                        .ok()
                        .and_then(|value| RemoteCommand::parse(&value));
                    match command {
                        Some(command) => {
                            if let Err(e) = command_state.apply_command(command).await {
                                command_state.notify(UiEvent::Error { message: e.to_string() });
                            }
                        }
                        None => tracing::debug!("Ignoring WebSocket frame: {}", text),
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::debug!("WebSocket client disconnected");
}

fn encode(event: &UiEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!("Failed to encode UI event: {}", e);
            None
        }
    }
}
