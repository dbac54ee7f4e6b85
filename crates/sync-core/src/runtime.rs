//! Runtime-side synchronizer.
//!
//! Runs inside the host application. Translates host lifecycle events into
//! `vtt-update`/`vtt-delete` messages for the dev server, and applies
//! `system-update` messages coming back from it.
//!
//! `handle_event` is the pure translation step. Binding it to the host's
//! event bus goes through a [`Session`], which owns the hook subscriptions
//! of one module generation.

use crate::conflict;
use crate::document::{Document, PackMetadata};
use crate::flatten::flatten;
use crate::hooks::{HookBus, Subscription};
use crate::host::{Host, HostError, Notice};
use crate::protocol::{ClientMessage, DeletePayload, ServerMessage, SystemUpdate, UpdatePayload};
use crate::root::{resolve_root, RootResolution};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Document {id} not found in pack {pack}")]
    DocumentNotFound { pack: String, id: String },

    #[error("Could not find document to update from {file}")]
    TargetNotFound { file: String },

    #[error("Invalid JSON in {file}: {reason}")]
    InvalidJson { file: String, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Outbound side of the development-session channel.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<()>;
}

/// What changed inside a pack, as reported by the pack-contents event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentsChange {
    Created { ids: Vec<String> },
    Updated { ids: Vec<String> },
    Deleted { ids: Vec<String> },
}

/// Host lifecycle events the synchronizer reacts to.
#[derive(Debug, Clone)]
pub enum LifecycleEvent<D> {
    Created(D),
    Updated(D),
    Deleted(D),
    PackContentsChanged {
        pack: PackMetadata,
        change: ContentsChange,
    },
}

/// Result of applying a system update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Content already matched; nothing was written.
    Unchanged,
    /// The document was updated.
    Updated,
}

/// Hook subscriptions of one module generation.
///
/// Dropping the session unsubscribes all of its hooks.
pub struct Session<D> {
    generation: u64,
    current: Arc<AtomicU64>,
    subscriptions: Vec<Subscription<LifecycleEvent<D>>>,
    events: mpsc::UnboundedReceiver<LifecycleEvent<D>>,
}

impl<D> Session<D> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a newer generation has replaced this session.
    pub fn is_stale(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.generation
    }

    /// Next event for this session; `None` once the session is stale.
    pub async fn next_event(&mut self) -> Option<LifecycleEvent<D>> {
        if self.is_stale() {
            return None;
        }
        let event = self.events.recv().await?;
        if self.is_stale() {
            debug!("Discarding event for stale generation {}", self.generation);
            return None;
        }
        Some(event)
    }

    /// Unsubscribe all hooks.
    pub fn dispose(self) {
        info!(
            "[foundryvtt-sync] Unmounting {} hook(s) of generation {}",
            self.subscriptions.len(),
            self.generation
        );
    }
}

/// Runtime-side synchronizer for one module.
pub struct RuntimeSync<H: Host, C: Channel> {
    module_id: String,
    host: Arc<H>,
    channel: Arc<C>,
    generation: Arc<AtomicU64>,
}

impl<H: Host, C: Channel> RuntimeSync<H, C> {
    pub fn new(module_id: impl Into<String>, host: Arc<H>, channel: Arc<C>) -> Self {
        Self {
            module_id: module_id.into(),
            host,
            channel,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Packs owned by the module.
    pub fn managed_packs(&self) -> Vec<PackMetadata> {
        self.host
            .packs()
            .into_iter()
            .filter(|p| p.is_managed_by(&self.module_id))
            .collect()
    }

    /// Start synchronizing once the host is ready.
    ///
    /// Asks the operator whether to push every managed pack to disk first,
    /// then mounts the hooks. Returns `None` if the module owns no packs.
    pub async fn activate(
        &self,
        bus: &Arc<HookBus<LifecycleEvent<H::Doc>>>,
    ) -> Option<Session<H::Doc>> {
        let packs = self.managed_packs();
        if packs.is_empty() {
            self.host.notify(Notice::warning(
                "foundryvtt-sync: Could not find compendiums matching the module ID.",
            ));
            return None;
        }

        let names: Vec<&str> = packs.iter().map(|p| p.name.as_str()).collect();
        let prompt = format!(
            "Sync {} {} compendiums to the file system? ({})",
            packs.len(),
            self.module_id,
            names.join(", ")
        );
        if self.host.confirm(&prompt).await {
            let sent = self.initial_sync(&packs).await;
            info!("[foundryvtt-sync] Initial sync sent {} document(s)", sent);
        }

        let session = self.mount(bus);
        self.host
            .notify(Notice::info("Compendium Sync is now active."));
        Some(session)
    }

    /// Replace a session after a hot reload of the module.
    pub fn reload(
        &self,
        old: Session<H::Doc>,
        bus: &Arc<HookBus<LifecycleEvent<H::Doc>>>,
    ) -> Session<H::Doc> {
        old.dispose();
        self.mount(bus)
    }

    /// Subscribe a new generation of hooks.
    pub fn mount(&self, bus: &Arc<HookBus<LifecycleEvent<H::Doc>>>) -> Session<H::Doc> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, events) = mpsc::unbounded_channel();
        let subscription = bus.subscribe(move |event| {
            let _ = tx.send(event);
        });
        debug!("[foundryvtt-sync] Mounted hooks, generation {}", generation);

        Session {
            generation,
            current: Arc::clone(&self.generation),
            subscriptions: vec![subscription],
            events,
        }
    }

    /// Process events of a session until it is disposed or replaced.
    pub async fn run(&self, session: &mut Session<H::Doc>) {
        while let Some(event) = session.next_event().await {
            self.dispatch(event).await;
        }
    }

    /// Flatten and send every document and folder of the given packs.
    pub async fn initial_sync(&self, packs: &[PackMetadata]) -> usize {
        let mut sent = 0;
        for pack in packs {
            let mut documents = self.host.pack_documents(&pack.id).await;
            documents.extend(self.host.pack_folders(&pack.id).await);

            for document in documents {
                let message = update_message(&document, &pack.name);
                match self.channel.send(message).await {
                    Ok(()) => sent += 1,
                    Err(e) => warn!("Failed to send {}: {}", document.uuid(), e),
                }
            }
        }
        sent
    }

    /// Translate a lifecycle event into outbound messages.
    ///
    /// Single-document events yield at most one message.
    pub async fn handle_event(
        &self,
        event: LifecycleEvent<H::Doc>,
    ) -> Result<Vec<ClientMessage>> {
        match event {
            LifecycleEvent::Created(document)
            | LifecycleEvent::Updated(document)
            | LifecycleEvent::Deleted(document) => {
                Ok(self.export_root_of(&document).into_iter().collect())
            }
            LifecycleEvent::PackContentsChanged { pack, change } => {
                if !pack.is_managed_by(&self.module_id) {
                    return Ok(Vec::new());
                }
                self.export_contents(&pack, change).await
            }
        }
    }

    /// Handle an event and send its messages, reporting any failure.
    ///
    /// Returns the number of messages sent.
    pub async fn dispatch(&self, event: LifecycleEvent<H::Doc>) -> usize {
        let messages = match self.handle_event(event).await {
            Ok(messages) => messages,
            Err(e) => {
                error!("[foundryvtt-sync] {}", e);
                self.host.notify(Notice::error(format!("[foundryvtt-sync] {}", e)));
                return 0;
            }
        };

        let mut sent = 0;
        for message in messages {
            match self.channel.send(message).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("[foundryvtt-sync] Failed to send message: {}", e),
            }
        }
        sent
    }

    /// Handle a message from the dev server.
    pub async fn on_server_message(&self, message: ServerMessage) -> Result<Option<ApplyOutcome>> {
        match message {
            ServerMessage::UpdateResponse(response) => {
                let json = &response.data.json;
                let name = json.get("name").and_then(Value::as_str).unwrap_or_default();
                let id = json.get("_id").and_then(Value::as_str).unwrap_or_default();
                info!("Received and saved {} ({})", name, id);
                Ok(None)
            }
            ServerMessage::SystemUpdate(update) => self.apply_system_update(update).await.map(Some),
        }
    }

    /// Apply a file edited on disk to the matching in-app document.
    pub async fn apply_system_update(&self, update: SystemUpdate) -> Result<ApplyOutcome> {
        let data: Value =
            serde_json::from_str(&update.json).map_err(|e| RuntimeError::InvalidJson {
                file: update.file.clone(),
                reason: e.to_string(),
            })?;

        let document = self.resolve_target(&data, &update.file).await.ok_or_else(|| {
            RuntimeError::TargetNotFound {
                file: update.file.clone(),
            }
        })?;

        let current = Value::Object(flatten(&document));
        if conflict::same_content(current, data.clone()) {
            debug!("{} is unchanged, skipping", update.file);
            return Ok(ApplyOutcome::Unchanged);
        }

        let Value::Object(record) = data else {
            return Err(RuntimeError::InvalidJson {
                file: update.file,
                reason: "expected a JSON object".into(),
            });
        };
        self.host
            .update_document(&document, record, update.timestamp)
            .await?;
        info!("Applied {} to {}", update.file, document.uuid());
        Ok(ApplyOutcome::Updated)
    }

    async fn resolve_target(&self, data: &Value, file: &str) -> Option<H::Doc> {
        if let Some(source) = conflict::source_reference(data) {
            if let Some(document) = self.host.from_uuid(source).await {
                return Some(document);
            }
        }

        let pack = conflict::pack_from_file(file)?;
        let id = data.get("_id").and_then(Value::as_str)?;
        self.host
            .from_uuid(&format!("Compendium.{}.{}.{}", self.module_id, pack, id))
            .await
    }

    fn export_root_of(&self, document: &H::Doc) -> Option<ClientMessage> {
        let root = match resolve_root(document, &self.module_id) {
            RootResolution::Root(root) => root,
            RootResolution::TopLevel | RootResolution::OutOfScope => return None,
        };

        let Some(pack) = root.pack().and_then(|id| self.host.pack(&id)) else {
            warn!("Could not find a pack for {}", root.uuid());
            self.host.notify(Notice::warning(format!(
                "[foundryvtt-sync] Could not find a parent compendium for {}",
                document.uuid()
            )));
            return None;
        };
        if !pack.is_managed_by(&self.module_id) {
            return None;
        }

        debug!("Sending update to parent compendium {}", root.uuid());
        Some(update_message(&root, &pack.name))
    }

    async fn export_contents(
        &self,
        pack: &PackMetadata,
        change: ContentsChange,
    ) -> Result<Vec<ClientMessage>> {
        match change {
            ContentsChange::Created { ids } | ContentsChange::Updated { ids } => {
                let mut messages = Vec::with_capacity(ids.len());
                for id in ids {
                    let document = self.host.get_document(&pack.id, &id).await.ok_or_else(|| {
                        RuntimeError::DocumentNotFound {
                            pack: pack.id.clone(),
                            id: id.clone(),
                        }
                    })?;
                    debug!("Document changed: {}", document.uuid());
                    messages.push(update_message(&document, &pack.name));
                }
                Ok(messages)
            }
            ContentsChange::Deleted { ids } => Ok(ids
                .into_iter()
                .map(|id| {
                    debug!("Document deleted: {}", id);
                    ClientMessage::Delete(DeletePayload {
                        id,
                        dir: pack.name.clone(),
                    })
                })
                .collect()),
        }
    }
}

fn update_message<D: Document>(document: &D, dir: &str) -> ClientMessage {
    ClientMessage::Update(UpdatePayload {
        json: flatten(document),
        dir: dir.to_string(),
    })
}

/// Channel that records messages in memory, for tests and dry runs.
#[derive(Default)]
pub struct RecordingChannel {
    sent: std::sync::Mutex<Vec<ClientMessage>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}
