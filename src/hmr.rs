// src/hmr.rs

//! Hot module replacement channel.
//!
//! Every browser tab holds one WebSocket at [`HMR_PATH`]. The channel owns the set of
//! connections; each connection has its own writer task fed by an unbounded queue, so
//! a broadcast is a series of non-blocking hand-offs and one slow socket never holds
//! up the others.

use crate::error::ConnectionError;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Path of the HMR WebSocket endpoint.
pub const HMR_PATH: &str = "/__hmr";

pub type ConnectionId = u64;

/// Lifecycle of one client socket. A connection that is closed is no longer in the
/// set, so [`HmrChannel::state`] reports it as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, handshake not yet queued. Skipped by broadcasts.
    Connecting,
    /// Handshake queued; receives broadcasts.
    Connected,
    /// Close frame queued; removed once the socket task ends.
    Closing,
}

/// Diagnostic attached to an `error` message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorData {
    /// Root-relative path of the file that failed to compile.
    pub path: String,
    pub message: String,
}

/// A message on the HMR wire, serialized as JSON tagged by `type`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HmrMessage {
    /// Handshake acknowledgment, sent once per connection.
    Connected,
    /// The module at `path` can be swapped in place.
    Update { path: String, timestamp: u64 },
    /// The page must reload.
    Reload {
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// A compile failed. Clients keep running the last good version.
    Error { data: ErrorData },
}

impl HmrMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HmrMessage::Connected => "connected",
            HmrMessage::Update { .. } => "update",
            HmrMessage::Reload { .. } => "reload",
            HmrMessage::Error { .. } => "error",
        }
    }
}

enum Outbound {
    Text(Arc<str>),
    Close,
}

struct ClientConnection {
    state: ConnectionState,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct Connections {
    clients: HashMap<ConnectionId, ClientConnection>,
    next_id: ConnectionId,
}

/// The set of connected HMR clients. Cheap to clone.
#[derive(Clone, Default)]
pub struct HmrChannel {
    connections: Arc<Mutex<Connections>>,
}

impl HmrChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a socket's outbound queue to the set in the `Connecting` state.
    fn register(&self, tx: mpsc::UnboundedSender<Outbound>) -> ConnectionId {
        let mut connections = self.connections.lock();
        connections.next_id += 1;
        let id = connections.next_id;
        connections.clients.insert(
            id,
            ClientConnection {
                state: ConnectionState::Connecting,
                tx,
            },
        );
        debug!(id, "HMR connection registered");
        id
    }

    /// Queues the handshake and moves a `Connecting` client to `Connected`.
    ///
    /// Both happen under one lock, so the handshake is always the first frame and no
    /// broadcast can slip in ahead of it.
    ///
    /// # Errors
    /// - [`ConnectionError::Closed`] if the client is unknown, not connecting, or its
    ///   writer is gone. The client is removed in the last case.
    /// - [`ConnectionError::Encode`] if the handshake cannot be serialized.
    fn acknowledge(&self, id: ConnectionId) -> Result<(), ConnectionError> {
        let handshake = encode(&HmrMessage::Connected)?;

        let mut connections = self.connections.lock();
        let client = match connections.clients.get_mut(&id) {
            Some(client) if client.state == ConnectionState::Connecting => client,
            _ => return Err(ConnectionError::Closed(id)),
        };
        if client.tx.send(Outbound::Text(handshake)).is_err() {
            connections.clients.remove(&id);
            return Err(ConnectionError::Closed(id));
        }
        client.state = ConnectionState::Connected;
        Ok(())
    }

    fn disconnect(&self, id: ConnectionId) {
        if self.connections.lock().clients.remove(&id).is_some() {
            debug!(id, "HMR connection removed");
        }
    }

    /// Sends `message` to every connected client and returns how many accepted it.
    ///
    /// A connection whose writer is gone is removed, which closes it; delivery to the
    /// rest carries on. `Connecting` and `Closing` clients are skipped. Zero clients is not an error.
    pub fn broadcast(&self, message: &HmrMessage) -> usize {
        let payload = match encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("{}", e);
                return 0;
            }
        };

        let mut connections = self.connections.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, client) in connections.clients.iter_mut() {
            if client.state != ConnectionState::Connected {
                continue;
            }
            if client.tx.send(Outbound::Text(Arc::clone(&payload))).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            connections.clients.remove(&id);
            debug!(id, "Dropped HMR connection after failed send");
        }
        debug!(kind = message.kind(), delivered, "Broadcast HMR message");
        delivered
    }

    /// Queues a close frame for every client and marks it `Closing`.
    ///
    /// Each connection leaves the set when its socket task ends; one whose writer is
    /// already gone is removed right away.
    pub fn close_all(&self) {
        let mut connections = self.connections.lock();
        let mut closing = 0;
        let mut dead = Vec::new();
        for (id, client) in connections.clients.iter_mut() {
            if client.state == ConnectionState::Closing {
                continue;
            }
            client.state = ConnectionState::Closing;
            if client.tx.send(Outbound::Close).is_ok() {
                closing += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            connections.clients.remove(&id);
        }
        if closing > 0 {
            info!("Closing {} HMR connection(s)", closing);
        }
    }

    /// Connections in the set, whatever their state.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().clients.len()
    }

    /// State of a live connection; `None` once it is closed.
    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.lock().clients.get(&id).map(|c| c.state)
    }

    /// Drives one upgraded socket until either side goes away.
    pub async fn serve(self, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = self.register(tx);
        if let Err(e) = self.acknowledge(id) {
            warn!(id, "Could not complete HMR handshake: {}", e);
            self.disconnect(id);
            return;
        }
        info!(id, "HMR client connected.");

        let mut send_task = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let frame = match outbound {
                    Outbound::Text(text) => Message::Text(text.to_string()),
                    Outbound::Close => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = sender.send(frame).await {
                    let err = ConnectionError::from(e);
                    warn!(id, "{}", err);
                    break;
                }
            }
        });

        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = receiver.next().await {
                match msg {
                    Message::Text(t) => debug!(id, "Received text from HMR client: {}", t),
                    Message::Close(_) => {
                        debug!(id, "HMR client sent Close frame.");
                        break;
                    }
                    _ => {}
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }
        self.disconnect(id);
        info!(id, "HMR client disconnected.");
    }
}

/// Handles incoming WebSocket upgrade requests on [`HMR_PATH`].
pub async fn websocket_handler(ws: WebSocketUpgrade, State(channel): State<HmrChannel>) -> Response {
    debug!("New HMR connection request.");
    ws.on_upgrade(move |socket| channel.serve(socket))
}

/// Serializes a message once so every recipient shares the same buffer.
fn encode(message: &HmrMessage) -> Result<Arc<str>, ConnectionError> {
    let json = serde_json::to_string(message)?;
    Ok(Arc::from(json))
}
