//! Client price socket.
//!
//! One task per socket owns both halves of the WebSocket and the receiving
//! end of the connection's delivery channel. The registration guard
//! deregisters the connection however the task ends.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use super::AppState;
use crate::application::services::registry::{ClientConnection, LtpRegistry};

/// Subscription frame sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscribeRequest {
    /// Instrument key to watch.
    #[serde(default)]
    pub instrument: String,
    /// Optional display symbol for fallback lookups.
    #[serde(default)]
    pub symbol: Option<String>,
}

impl SubscribeRequest {
    /// Parse a text frame; `None` unless it names an instrument.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let request: Self = serde_json::from_str(text).ok()?;
        if request.instrument.trim().is_empty() {
            return None;
        }
        Some(request)
    }
}

/// Removes the connection from the registry on drop.
struct Registration {
    registry: Arc<LtpRegistry>,
    connection: ClientConnection,
}

impl Registration {
    fn subscribe(&self, request: &SubscribeRequest) {
        self.registry.add_client(
            &self.connection,
            request.instrument.trim(),
            request.symbol.as_deref(),
        );
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove_client(self.connection.id());
    }
}

pub(super) async fn ltp_socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // First text frame decides the instrument
    let request = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match SubscribeRequest::parse(text.as_str()) {
                Some(request) => break request,
                None => {
                    tracing::debug!("First frame carried no instrument, closing socket");
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            Some(Ok(Message::Close(_)) | Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    let (connection, mut ticks) = state.registry.open_connection();
    let registration = Registration {
        registry: Arc::clone(&state.registry),
        connection,
    };
    registration.subscribe(&request);

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            tick = ticks.recv() => {
                let Some(tick) = tick else { break };
                let text = match serde_json::to_string(&tick) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            instrument = %tick.instrument,
                            "Failed to encode tick"
                        );
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!(
                        connection = registration.connection.id(),
                        error = %e,
                        "Client send failed"
                    );
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(request) = SubscribeRequest::parse(text.as_str()) {
                        registration.subscribe(&request);
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(connection = registration.connection.id(), "Client socket closed");
}
