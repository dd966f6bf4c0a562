//! WebSocket ingress for out-of-process secondaries.
//!
//! Each socket is one context. Text frames carry JSON relay messages;
//! the socket's own address is passed to the sink with every message so a
//! handshake can register it.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use cross_relay_core::{ContextHandle, InboundSink};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::WeakPort;

/// WebSocket handler state.
pub struct WsState<S> {
    /// Receiver of every inbound message, usually a primary relay.
    pub sink: Arc<S>,
}

impl<S> WsState<S> {
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }
}

// Derive would require `S: Clone`.
impl<S> Clone for WsState<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler<S>(
    ws: WebSocketUpgrade,
    State(state): State<WsState<S>>,
) -> impl IntoResponse
where
    S: InboundSink + 'static,
{
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket<S>(socket: WebSocket, state: WsState<S>)
where
    S: InboundSink + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    // Messages from the primary to this context
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = ContextHandle::new(Arc::new(WeakPort::new(&tx)));
    tracing::debug!(context = %handle.id(), "Socket connected");

    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let parsed = match msg {
            Ok(Message::Text(text)) => serde_json::from_str::<Value>(text.as_str()),
            Ok(Message::Binary(data)) => serde_json::from_slice::<Value>(&data),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        match parsed {
            Ok(message) => state.sink.receive(message, Some(handle.clone())),
            Err(e) => tracing::warn!("Invalid relay message: {e}"),
        }
    }

    tracing::debug!(context = %handle.id(), "Socket closed");
    drop(tx);
    send_task.abort();
}

/// Create WebSocket router serving `/relay`.
///
/// # Example
/// ```ignore
/// let primary = Arc::new(PrimaryRelay::default());
/// let app = Router::new().merge(create_ws_router(primary));
/// ```
#[must_use]
pub fn create_ws_router<S>(sink: Arc<S>) -> axum::Router
where
    S: InboundSink + 'static,
{
    axum::Router::new()
        .route("/relay", axum::routing::get(ws_handler::<S>))
        .with_state(WsState::new(sink))
}
