//! Individual client connection management.
//!
//! Each client connection wraps a WebSocket stream, handling the split
//! between read and write halves for async operation.

use anyhow::{anyhow, Result};
use compendium_sync_core::protocol::MAX_MESSAGE_SIZE;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Frame received from a client connection.
#[derive(Debug)]
pub struct IncomingFrame {
    /// Connection ID (e.g., "client-1")
    pub client_id: String,
    /// Raw frame data
    pub data: Vec<u8>,
}

/// Event emitted by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Received a frame from the client
    Frame(IncomingFrame),
    /// Connection was closed
    Closed { client_id: String },
}

/// A single WebSocket connection to a running application.
pub struct ClientConnection {
    pub client_id: String,
    /// Write half of the WebSocket (wrapped for sharing across tasks)
    write: Arc<Mutex<futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>>>,
    /// Handle to the read task
    read_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Create a new client connection from a WebSocket stream.
    ///
    /// Spawns a read task that forwards frames to the event channel.
    pub fn new(
        client_id: String,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_client_id = client_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_client_id, read, event_tx).await;
        });

        Self {
            client_id,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        client_id: String,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data.to_vec(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", client_id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            client_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    let _ = event_tx.send(ConnectionEvent::Frame(IncomingFrame {
                        client_id: client_id.clone(),
                        data,
                    }));
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", client_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", client_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", client_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed {
            client_id: client_id.clone(),
        });
    }

    /// Send a JSON text frame to the client.
    pub async fn send(&self, text: &str) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }

        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
