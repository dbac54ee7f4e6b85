//! The dev server: materializes runtime notifications and pushes file edits
//! back to the running application.

use crate::native_fs::NativeFs;
use crate::server::{ServerEvent, WebSocketServer};
use crate::watcher::{FileEvent, FileEventKind, FileWatcher};
use anyhow::{Context, Result};
use compendium_sync_core::config::SyncOptions;
use compendium_sync_core::fs::FileSystem;
use compendium_sync_core::materialize::{DeleteOutcome, Materializer, UpdateOutcome};
use compendium_sync_core::protocol::{ClientMessage, ServerMessage, UpdateResponse};
use compendium_sync_core::push::PushBack;
use compendium_sync_core::transform::Transformer;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub struct DevServer {
    root: PathBuf,
    materializer: Materializer<Arc<NativeFs>>,
    push: PushBack<Arc<NativeFs>>,
    server: WebSocketServer,
}

impl DevServer {
    pub fn new(root: PathBuf, options: SyncOptions, transformer: Arc<dyn Transformer>) -> Self {
        let fs = Arc::new(NativeFs::new(root.clone()));
        let materializer =
            Materializer::new(Arc::clone(&fs), options.clone()).with_transformer(transformer);
        let push = PushBack::new(fs, &options, materializer.ledger());

        Self {
            root,
            materializer,
            push,
            server: WebSocketServer::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &SyncOptions {
        self.materializer.options()
    }

    /// Create the data directory so it can be watched.
    pub async fn prepare(&self) -> Result<()> {
        let data_root = self.options().data_root();
        self.materializer
            .fs()
            .mkdir(&data_root)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_root))
    }

    /// Start watching the data directory.
    pub fn watch(&self) -> Result<FileWatcher> {
        FileWatcher::new(self.root.clone(), &self.options().data_root())
    }

    /// Handle a decoded message from a client.
    pub async fn on_client_message(&mut self, client_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Update(payload) => {
                let ack = ServerMessage::UpdateResponse(UpdateResponse {
                    data: payload.clone(),
                });
                match self.materializer.on_update(payload).await {
                    Ok(UpdateOutcome::Written { path, removed }) => {
                        for stale in &removed {
                            info!("Removed {} (renamed to {})", stale, path);
                        }
                        if let Err(e) = self.server.send(client_id, &ack).await {
                            warn!("Failed to acknowledge update to {}: {}", client_id, e);
                        }
                    }
                    Ok(UpdateOutcome::Vetoed) | Ok(UpdateOutcome::Ignored) => {}
                    Err(e) => {
                        error!("Failed to write update from {}: {}", client_id, e);
                    }
                }
            }
            ClientMessage::Delete(payload) => {
                let id = payload.id.clone();
                match self.materializer.on_delete(payload).await {
                    Ok(DeleteOutcome::Moved(paths)) => {
                        info!("Deleted {} ({} file(s))", id, paths.len());
                    }
                    Ok(DeleteOutcome::NotFound) => {
                        debug!("No file found for deleted document {}", id);
                    }
                    // Already reported by the materializer
                    Ok(DeleteOutcome::Ignored) | Ok(DeleteOutcome::MoveFailed { .. }) => {}
                    Err(e) => {
                        error!("Failed to delete {}: {}", id, e);
                    }
                }
            }
        }
    }

    /// Handle a change event from the watcher.
    pub async fn on_file_changed(&mut self, event: FileEvent) {
        if event.kind == FileEventKind::Deleted {
            debug!("File removed: {}", event.path);
            return;
        }

        match self.push.on_file_changed(&event.path).await {
            Ok(Some(message)) => {
                self.server.broadcast(&message).await;
                info!(
                    "Pushed {} to {} client(s)",
                    event.path,
                    self.server.client_count()
                );
            }
            Ok(None) => {}
            Err(e) => {
                error!("Failed to read {}: {}", event.path, e);
            }
        }
    }

    /// Run the event loop until `shutdown` resolves.
    pub async fn run(
        mut self,
        listener: TcpListener,
        mut watcher: FileWatcher,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.server.accept_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                Some(event) = watcher.event_rx().recv() => {
                    self.on_file_changed(event).await;
                }

                Some(event) = self.server.poll_event() => {
                    match event {
                        ServerEvent::ClientConnected { client_id } => {
                            info!("Client connected: {}", client_id);
                        }
                        ServerEvent::Message { client_id, message } => {
                            self.on_client_message(&client_id, message).await;
                        }
                        ServerEvent::ClientDisconnected { client_id } => {
                            info!("Client disconnected: {}", client_id);
                        }
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }
}
