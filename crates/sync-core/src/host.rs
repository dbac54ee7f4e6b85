//! Host application capabilities used by the runtime synchronizer.
//!
//! The pack and document registries belong to the host; the synchronizer
//! only reads them through this trait, plus the two write-side calls it
//! needs (document update, operator notices).
//!
//! Implementations:
//! - `InMemoryHost` - For testing
//! - Host adapters bind the trait to the real application

use crate::document::{Document, MemoryDocument, PackMetadata, Record};
use crate::flatten::KEY_FIELD;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Document update rejected: {0}")]
    UpdateRejected(String),
}

/// Severity of an operator-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// An operator-visible notification raised inside the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Capabilities of the running host application.
#[async_trait]
pub trait Host: Send + Sync {
    type Doc: Document + 'static;

    /// Look up a pack by collection id (`<package>.<name>`).
    fn pack(&self, id: &str) -> Option<PackMetadata>;

    /// All packs known to the host.
    fn packs(&self) -> Vec<PackMetadata>;

    /// Live root document or folder container by id within a pack.
    async fn get_document(&self, pack: &str, id: &str) -> Option<Self::Doc>;

    /// All root documents of a pack.
    async fn pack_documents(&self, pack: &str) -> Vec<Self::Doc>;

    /// All folder containers of a pack.
    async fn pack_folders(&self, pack: &str) -> Vec<Self::Doc>;

    /// Resolve a host-wide document reference.
    async fn from_uuid(&self, uuid: &str) -> Option<Self::Doc>;

    /// Apply data to a document, stamping `modified_time` as its modification time.
    ///
    /// `data` is the flattened form, embedded collections included. Data that
    /// cannot be applied is rejected rather than dropped.
    async fn update_document(
        &self,
        document: &Self::Doc,
        data: Record,
        modified_time: u64,
    ) -> Result<(), HostError>;

    /// Ask the operator a yes/no question.
    async fn confirm(&self, prompt: &str) -> bool;

    /// Show an operator-visible notice.
    fn notify(&self, notice: Notice);
}

struct PackEntry {
    metadata: PackMetadata,
    documents: Vec<MemoryDocument>,
    folders: Vec<MemoryDocument>,
}

/// In-memory host for testing.
pub struct InMemoryHost {
    packs: RwLock<Vec<PackEntry>>,
    notices: RwLock<Vec<Notice>>,
    prompts: RwLock<Vec<String>>,
    confirm_answer: AtomicBool,
    update_count: AtomicUsize,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self {
            packs: RwLock::new(Vec::new()),
            notices: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            confirm_answer: AtomicBool::new(true),
            update_count: AtomicUsize::new(0),
        }
    }

    /// Register a pack.
    pub fn add_pack(&self, metadata: PackMetadata) {
        self.packs.write().unwrap().push(PackEntry {
            metadata,
            documents: Vec::new(),
            folders: Vec::new(),
        });
    }

    /// Create a root document in a registered pack.
    pub fn create_document(
        &self,
        pack: &str,
        document_name: &str,
        collection_name: &str,
        data: Value,
    ) -> MemoryDocument {
        let document = MemoryDocument::new(document_name, collection_name, Some(pack), data);
        self.with_pack(pack, |entry| entry.documents.push(document.clone()));
        document
    }

    /// Create a folder container in a registered pack.
    pub fn create_folder(&self, pack: &str, data: Value) -> MemoryDocument {
        let folder = MemoryDocument::new("Folder", "folders", Some(pack), data);
        self.with_pack(pack, |entry| entry.folders.push(folder.clone()));
        folder
    }

    /// Remove a root document from its pack.
    pub fn remove_document(&self, pack: &str, id: &str) {
        self.with_pack(pack, |entry| entry.documents.retain(|d| d.id() != id));
    }

    /// Answer future confirmation prompts with `answer`.
    pub fn set_confirm_answer(&self, answer: bool) {
        self.confirm_answer.store(answer, Ordering::Relaxed);
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.read().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.read().unwrap().clone()
    }

    /// Number of `update_document` calls so far.
    pub fn update_count(&self) -> usize {
        self.update_count.load(Ordering::Relaxed)
    }

    fn with_pack(&self, pack: &str, f: impl FnOnce(&mut PackEntry)) {
        let mut packs = self.packs.write().unwrap();
        if let Some(entry) = packs.iter_mut().find(|p| p.metadata.id == pack) {
            f(entry);
        }
    }

    fn all_in_pack(&self, pack: &str) -> Vec<MemoryDocument> {
        let packs = self.packs.read().unwrap();
        packs
            .iter()
            .filter(|p| p.metadata.id == pack)
            .flat_map(|p| p.documents.iter().chain(p.folders.iter()).cloned())
            .collect()
    }
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(message: String) -> HostError {
    HostError::UpdateRejected(message)
}

/// Every embedded entry in `data` must name an existing child.
fn check_embedded(document: &MemoryDocument, data: &Record) -> Result<(), HostError> {
    for collection in document.collections() {
        let Some(entries) = data.get(&collection.name) else {
            continue;
        };
        let Value::Array(entries) = entries else {
            return Err(rejected(format!(
                "{} of {} is not an array",
                collection.name,
                document.id()
            )));
        };
        for entry in entries {
            let Value::Object(entry) = entry else {
                return Err(rejected(format!("malformed entry in {}", collection.name)));
            };
            let id = entry.get("_id").and_then(Value::as_str).unwrap_or_default();
            let Some(child) = collection.contents.iter().find(|c| c.id() == id) else {
                return Err(rejected(format!(
                    "no embedded document {} in {} of {}",
                    id,
                    collection.name,
                    document.id()
                )));
            };
            check_embedded(child, entry)?;
        }
    }
    Ok(())
}

/// Merge own fields and recurse into embedded children by `_id`. Children
/// missing from a present collection array are removed.
fn apply_record(document: &MemoryDocument, data: Record) {
    let collections = document.collections();
    let mut own = Record::new();

    for (key, value) in data {
        if key == KEY_FIELD {
            continue;
        }
        let Some(collection) = collections.iter().find(|c| c.name == key) else {
            own.insert(key, value);
            continue;
        };
        let Value::Array(entries) = value else {
            continue;
        };

        let entries: Vec<Record> = entries
            .into_iter()
            .filter_map(|entry| match entry {
                Value::Object(entry) => Some(entry),
                _ => None,
            })
            .collect();
        for child in &collection.contents {
            let kept = entries
                .iter()
                .any(|e| e.get("_id").and_then(Value::as_str) == Some(child.id()));
            if !kept {
                document.remove_embedded(child.id());
            }
        }
        for entry in entries {
            let id = entry.get("_id").and_then(Value::as_str).unwrap_or_default();
            if let Some(child) = collection.contents.iter().find(|c| c.id() == id) {
                apply_record(child, entry);
            }
        }
    }

    document.merge(&own);
}

#[async_trait]
impl Host for InMemoryHost {
    type Doc = MemoryDocument;

    fn pack(&self, id: &str) -> Option<PackMetadata> {
        let packs = self.packs.read().unwrap();
        packs
            .iter()
            .find(|p| p.metadata.id == id)
            .map(|p| p.metadata.clone())
    }

    fn packs(&self) -> Vec<PackMetadata> {
        let packs = self.packs.read().unwrap();
        packs.iter().map(|p| p.metadata.clone()).collect()
    }

    async fn get_document(&self, pack: &str, id: &str) -> Option<MemoryDocument> {
        self.all_in_pack(pack).into_iter().find(|d| d.id() == id)
    }

    async fn pack_documents(&self, pack: &str) -> Vec<MemoryDocument> {
        let packs = self.packs.read().unwrap();
        packs
            .iter()
            .filter(|p| p.metadata.id == pack)
            .flat_map(|p| p.documents.iter().cloned())
            .collect()
    }

    async fn pack_folders(&self, pack: &str) -> Vec<MemoryDocument> {
        let packs = self.packs.read().unwrap();
        packs
            .iter()
            .filter(|p| p.metadata.id == pack)
            .flat_map(|p| p.folders.iter().cloned())
            .collect()
    }

    /// Accepts `Compendium.<package>.<pack>[.<Type>.<id>]*.<id>`; the last
    /// segment names the target, anywhere in the pack's trees.
    async fn from_uuid(&self, uuid: &str) -> Option<MemoryDocument> {
        let rest = uuid.strip_prefix("Compendium.")?;
        let parts: Vec<&str> = rest.split('.').collect();
        if parts.len() < 3 {
            return None;
        }
        let pack = format!("{}.{}", parts[0], parts[1]);
        let target = parts[parts.len() - 1];
        self.all_in_pack(&pack)
            .iter()
            .find_map(|root| root.find(target))
    }

    async fn update_document(
        &self,
        document: &MemoryDocument,
        data: Record,
        modified_time: u64,
    ) -> Result<(), HostError> {
        if data.get("_id").and_then(Value::as_str) != Some(document.id()) {
            return Err(HostError::UpdateRejected(format!(
                "id mismatch for {}",
                document.id()
            )));
        }

        check_embedded(document, &data)?;
        apply_record(document, data);

        let mut stats = match document.to_json().get("_stats") {
            Some(Value::Object(stats)) => stats.clone(),
            _ => Record::new(),
        };
        stats.insert("modifiedTime".into(), Value::from(modified_time));
        document.set("_stats", Value::Object(stats));

        self.update_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn confirm(&self, prompt: &str) -> bool {
        self.prompts.write().unwrap().push(prompt.to_string());
        self.confirm_answer.load(Ordering::Relaxed)
    }

    fn notify(&self, notice: Notice) {
        self.notices.write().unwrap().push(notice);
    }
}
