//! WebSocket server for the running application's connections.
//!
//! Manages connection lifecycle and decodes custom-event frames. Callers see
//! `ServerEvent`s with already-decoded messages via `poll_event()`; frames
//! that are not events of this protocol are logged and dropped here.

use crate::connection::{ClientConnection, ConnectionEvent};
use anyhow::Result;
use compendium_sync_core::protocol::{ClientMessage, ProtocolError, ServerMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// Event emitted by the server.
#[derive(Debug)]
pub enum ServerEvent {
    /// A client connected.
    ClientConnected { client_id: String },
    /// A decoded message from a client.
    Message {
        client_id: String,
        message: ClientMessage,
    },
    /// A client disconnected.
    ClientDisconnected { client_id: String },
}

/// WebSocket server managing client connections.
pub struct WebSocketServer {
    /// Open connections indexed by client ID
    clients: HashMap<String, ClientConnection>,
    /// Counter for generating client IDs
    next_client_id: u64,
    /// Connections opened since the last `poll_event`
    connected: Vec<String>,
    /// Channel sender for connection events (frames, closes)
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Channel receiver for connection events
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl WebSocketServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            connected: Vec::new(),
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Handle a new incoming TCP connection by upgrading it to WebSocket.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before upgrade from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let client_id = format!("client-{}", self.next_client_id);
        self.next_client_id += 1;

        info!("New connection from {} (client_id: {})", addr, client_id);

        let conn = ClientConnection::new(client_id.clone(), ws_stream, self.event_tx.clone());
        self.clients.insert(client_id.clone(), conn);
        self.connected.push(client_id);
    }

    /// Wait for the next server event.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        if !self.connected.is_empty() {
            let client_id = self.connected.remove(0);
            return Some(ServerEvent::ClientConnected { client_id });
        }

        loop {
            let event = self.event_rx.recv().await?;

            match event {
                ConnectionEvent::Frame(frame) => match ClientMessage::from_json(&frame.data) {
                    Ok(message) => {
                        return Some(ServerEvent::Message {
                            client_id: frame.client_id,
                            message,
                        });
                    }
                    Err(ProtocolError::NotCustom(_)) | Err(ProtocolError::UnknownEvent(_)) => {
                        debug!("Ignoring foreign frame from {}", frame.client_id);
                    }
                    Err(e) => {
                        warn!("Dropping frame from {}: {}", frame.client_id, e);
                    }
                },
                ConnectionEvent::Closed { client_id } => {
                    if self.clients.remove(&client_id).is_some() {
                        return Some(ServerEvent::ClientDisconnected { client_id });
                    }
                }
            }
        }
    }

    /// Send a message to a specific client.
    pub async fn send(&self, client_id: &str, message: &ServerMessage) -> Result<()> {
        let conn = self
            .clients
            .get(client_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown client: {}", client_id))?;

        conn.send(&message.to_json()).await
    }

    /// Broadcast a message to all connected clients.
    pub async fn broadcast(&self, message: &ServerMessage) {
        let text = message.to_json();
        for (client_id, conn) in &self.clients {
            if let Err(e) = conn.send(&text).await {
                warn!("Failed to broadcast to {}: {}", client_id, e);
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}
