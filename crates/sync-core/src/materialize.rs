//! Dev-server side: keeps `<dataDirectory>/<pack>/<name>_<id>.json` in step
//! with update and delete notifications from the runtime.
//!
//! Every file in a pack directory is identified by its `_id`, not by its
//! name. An update therefore scans the directory and removes any other file
//! carrying the same `_id` (the document was renamed). Deletes never remove
//! data; the file is moved into `<pack>/_deleted/`.

use crate::config::SyncOptions;
use crate::document::Record;
use crate::flatten::KEY_FIELD;
use crate::fs::{join, FileSystem, FsError};
use crate::naming::{file_name, is_valid_id};
use crate::protocol::{DeletePayload, UpdatePayload};
use crate::transform::{Identity, Transformer, Verdict};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Soft-delete directory inside each pack directory.
pub const DELETED_DIR: &str = "_deleted";

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("Record is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid pack directory: {0}")]
    InvalidDirectory(String),

    #[error("Invalid document id: {0}")]
    InvalidId(String),

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, MaterializeError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record was written to `path`; `removed` lists stale files of the
    /// same document that were deleted.
    Written { path: String, removed: Vec<String> },
    /// The transformer refused the record.
    Vetoed,
    /// The record was excluded by type.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Files moved into `_deleted/`, by original path.
    Moved(Vec<String>),
    NotFound,
    Ignored,
    MoveFailed { path: String, reason: String },
}

/// Bytes most recently written per path by the materializer.
///
/// The file watcher reports our own writes back to us; an event whose file
/// content still equals what we wrote is an echo and is not pushed back.
#[derive(Debug, Default)]
pub struct WriteLedger {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl WriteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, path: &str, content: &[u8]) {
        self.entries().insert(path.to_string(), content.to_vec());
    }

    /// Drop the entry of a path we removed ourselves.
    pub fn forget(&self, path: &str) {
        self.entries().remove(path);
    }

    /// Whether `content` at `path` is exactly what we last wrote there.
    /// A matching entry is consumed.
    pub fn take_echo(&self, path: &str, content: &[u8]) -> bool {
        let mut entries = self.entries();
        match entries.get(path) {
            Some(written) if written.as_slice() == content => {
                entries.remove(path);
                true
            }
            Some(_) => {
                // Changed since our write; the entry is stale either way.
                entries.remove(path);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a record is an Adventure document.
pub fn is_adventure(record: &Record) -> bool {
    record.get("type").and_then(Value::as_str) == Some("Adventure")
        || record
            .get(KEY_FIELD)
            .and_then(Value::as_str)
            .is_some_and(|key| key.starts_with("!adventures!"))
}

/// Serialize a record the way it is stored on disk: one-tab indentation and a
/// trailing newline.
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    record
        .serialize(&mut serializer)
        .expect("JSON map serialization should not fail");
    buf.push(b'\n');
    buf
}

fn required<'a>(record: &'a Record, field: &'static str) -> Result<&'a str> {
    record
        .get(field)
        .and_then(Value::as_str)
        .ok_or(MaterializeError::MissingField(field))
}

/// Writes and soft-deletes pack files.
pub struct Materializer<F: FileSystem> {
    fs: F,
    options: SyncOptions,
    transformer: Arc<dyn Transformer>,
    ledger: Arc<WriteLedger>,
}

impl<F: FileSystem> Materializer<F> {
    pub fn new(fs: F, options: SyncOptions) -> Self {
        Self {
            fs,
            options,
            transformer: Arc::new(Identity),
            ledger: Arc::new(WriteLedger::new()),
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn ledger(&self) -> Arc<WriteLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    fn pack_dir(&self, dir: &str) -> Result<String> {
        let invalid = dir.is_empty()
            || dir.starts_with('/')
            || dir.contains('\\')
            || dir.split('/').any(|segment| segment == ".." || segment == DELETED_DIR);
        if invalid {
            return Err(MaterializeError::InvalidDirectory(dir.to_string()));
        }
        Ok(join(&self.options.data_root(), dir))
    }

    /// Parse every file in `dir` (directories skipped), yielding its path and `_id`.
    async fn scan(&self, dir: &str) -> Result<Vec<(String, Option<String>)>> {
        let mut files = Vec::new();
        for entry in self.fs.list(dir).await? {
            if entry.is_dir {
                continue;
            }
            let path = join(dir, &entry.name);
            let bytes = self.fs.read(&path).await?;
            let value: Value =
                serde_json::from_slice(&bytes).map_err(|e| MaterializeError::Parse {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            let id = value.get("_id").and_then(Value::as_str).map(str::to_string);
            files.push((path, id));
        }
        Ok(files)
    }

    /// Materialize an updated root document.
    pub async fn on_update(&self, payload: UpdatePayload) -> Result<UpdateOutcome> {
        let UpdatePayload { mut json, dir } = payload;
        let name = required(&json, "name")?.to_string();
        required(&json, "_id")?;
        info!("Received an update: {}", name);

        if self.options.ignore_adventure_hmr && is_adventure(&json) {
            info!("Ignoring adventure \"{}\"", name);
            return Ok(UpdateOutcome::Ignored);
        }

        if self.transformer.transform(&mut json).await == Verdict::Veto {
            warn!("Transformer vetoed \"{}\"! No changes have been made.", name);
            return Ok(UpdateOutcome::Vetoed);
        }

        let name = required(&json, "name")?;
        let id = required(&json, "_id")?;
        if !is_valid_id(id) {
            return Err(MaterializeError::InvalidId(id.to_string()));
        }

        let dir_path = self.pack_dir(&dir)?;
        self.fs.mkdir(&dir_path).await?;
        let path = join(&dir_path, &file_name(name, id));

        let mut removed = Vec::new();
        for (existing, existing_id) in self.scan(&dir_path).await? {
            if existing != path && existing_id.as_deref() == Some(id) {
                debug!("Removing stale file {}", existing);
                self.fs.delete(&existing).await?;
                self.ledger.forget(&existing);
                removed.push(existing);
            }
        }

        let content = encode_record(&json);
        self.fs.write(&path, &content).await?;
        self.ledger.record(&path, &content);
        info!("Wrote {}", path);

        Ok(UpdateOutcome::Written { path, removed })
    }

    /// Soft-delete every file of a root document into `_deleted/`.
    pub async fn on_delete(&self, payload: DeletePayload) -> Result<DeleteOutcome> {
        let dir_path = self.pack_dir(&payload.dir)?;
        if !self.fs.exists(&dir_path).await? {
            debug!("No pack directory {} for {}", dir_path, payload.id);
            return Ok(DeleteOutcome::NotFound);
        }

        let mut moved = Vec::new();
        for (path, id) in self.scan(&dir_path).await? {
            if id.as_deref() != Some(payload.id.as_str()) {
                continue;
            }

            if self.options.ignore_adventure_hmr {
                let bytes = self.fs.read(&path).await?;
                let record: Record =
                    serde_json::from_slice(&bytes).map_err(|e| MaterializeError::Parse {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                if is_adventure(&record) {
                    info!("Ignoring adventure delete for {}", path);
                    return Ok(DeleteOutcome::Ignored);
                }
            }

            let deleted_dir = join(&dir_path, DELETED_DIR);
            let file = path.rsplit('/').next().unwrap_or(path.as_str());
            let target = join(&deleted_dir, file);
            let result = match self.fs.mkdir(&deleted_dir).await {
                Ok(()) => self.fs.rename(&path, &target).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(
                    "Could not move file to _deleted directory. Remove manually! {}: {}",
                    path, e
                );
                return Ok(DeleteOutcome::MoveFailed {
                    path,
                    reason: e.to_string(),
                });
            }
            info!("Moved {} to {}", path, target);
            self.ledger.forget(&path);
            moved.push(path);
        }

        if moved.is_empty() {
            Ok(DeleteOutcome::NotFound)
        } else {
            Ok(DeleteOutcome::Moved(moved))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn update(json: Value, dir: &str) -> UpdatePayload {
        UpdatePayload {
            json: record(json),
            dir: dir.to_string(),
        }
    }

    fn delete(id: &str, dir: &str) -> DeletePayload {
        DeletePayload {
            id: id.to_string(),
            dir: dir.to_string(),
        }
    }

    fn materializer() -> Materializer<Arc<InMemoryFs>> {
        Materializer::new(Arc::new(InMemoryFs::new()), SyncOptions::default())
    }

    async fn read_json(fs: &InMemoryFs, path: &str) -> Value {
        serde_json::from_slice(&fs.read(path).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_update_writes_tab_indented_file() {
        let m = materializer();
        let outcome = m
            .on_update(update(
                json!({"_id": "abc123", "name": "Goblin", "_key": "!actors!abc123", "items": []}),
                "monsters",
            ))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            UpdateOutcome::Written {
                path: "data/monsters/Goblin_abc123.json".into(),
                removed: vec![],
            }
        );

        let bytes = m.fs().read("data/monsters/Goblin_abc123.json").await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\n\t\""));
        assert!(text.ends_with("}\n"));
        assert!(!text.ends_with("\n\n"));

        let read_back = read_json(m.fs(), "data/monsters/Goblin_abc123.json").await;
        assert_eq!(
            read_back,
            json!({"_id": "abc123", "name": "Goblin", "_key": "!actors!abc123", "items": []})
        );
    }

    #[tokio::test]
    async fn test_rename_removes_stale_file() {
        let m = materializer();
        m.on_update(update(json!({"_id": "abc123", "name": "Goblin"}), "monsters"))
            .await
            .unwrap();
        m.on_update(update(json!({"_id": "other", "name": "Orc"}), "monsters"))
            .await
            .unwrap();

        let outcome = m
            .on_update(update(json!({"_id": "abc123", "name": "Hobgoblin"}), "monsters"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            UpdateOutcome::Written {
                path: "data/monsters/Hobgoblin_abc123.json".into(),
                removed: vec!["data/monsters/Goblin_abc123.json".into()],
            }
        );
        assert_eq!(
            m.fs().file_paths(),
            vec![
                "data/monsters/Hobgoblin_abc123.json".to_string(),
                "data/monsters/Orc_other.json".to_string(),
            ]
        );
        // The removed file leaves no ledger entry behind
        assert_eq!(m.ledger().len(), 2);
    }

    #[tokio::test]
    async fn test_same_name_overwrites_in_place() {
        let m = materializer();
        m.on_update(update(json!({"_id": "abc123", "name": "Goblin", "hp": 7}), "monsters"))
            .await
            .unwrap();
        m.on_update(update(json!({"_id": "abc123", "name": "Goblin", "hp": 9}), "monsters"))
            .await
            .unwrap();

        assert_eq!(m.fs().file_paths().len(), 1);
        let value = read_json(m.fs(), "data/monsters/Goblin_abc123.json").await;
        assert_eq!(value["hp"], 9);
    }

    #[tokio::test]
    async fn test_sanitized_file_name() {
        let m = materializer();
        let outcome = m
            .on_update(update(json!({"_id": "x1", "name": "Gobl*n #1"}), "monsters"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            UpdateOutcome::Written { ref path, .. } if path == "data/monsters/Gobl_n__1_x1.json"
        ));
    }

    #[tokio::test]
    async fn test_unparseable_file_aborts_update() {
        let m = materializer();
        m.fs().mkdir("data/monsters").await.unwrap();
        m.fs()
            .write("data/monsters/broken.json", b"{ not json")
            .await
            .unwrap();

        let result = m
            .on_update(update(json!({"_id": "abc123", "name": "Goblin"}), "monsters"))
            .await;
        assert!(matches!(result, Err(MaterializeError::Parse { .. })));
        assert!(!m
            .fs()
            .exists("data/monsters/Goblin_abc123.json")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let m = materializer();
        let result = m.on_update(update(json!({"name": "Goblin"}), "monsters")).await;
        assert!(matches!(result, Err(MaterializeError::MissingField("_id"))));

        let result = m.on_update(update(json!({"_id": "abc"}), "monsters")).await;
        assert!(matches!(result, Err(MaterializeError::MissingField("name"))));
    }

    #[tokio::test]
    async fn test_directory_escape_rejected() {
        let m = materializer();
        let result = m
            .on_update(update(json!({"_id": "a", "name": "A"}), "../outside"))
            .await;
        assert!(matches!(result, Err(MaterializeError::InvalidDirectory(_))));
        assert!(m.fs().file_paths().is_empty());
    }

    #[tokio::test]
    async fn test_path_like_id_rejected() {
        let m = materializer();
        for id in ["../../escape", "a/b", "..\\x"] {
            let result = m
                .on_update(update(json!({"_id": id, "name": "A"}), "monsters"))
                .await;
            assert!(matches!(result, Err(MaterializeError::InvalidId(_))), "{}", id);
        }
        assert!(m.fs().file_paths().is_empty());
    }

    #[tokio::test]
    async fn test_transformer_can_rewrite_and_veto() {
        let rename = |record: &mut Record| {
            record.insert("name".into(), json!("Renamed"));
            Verdict::Keep
        };
        let m = materializer().with_transformer(Arc::new(rename));
        let outcome = m
            .on_update(update(json!({"_id": "a1", "name": "Original"}), "items"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            UpdateOutcome::Written { ref path, .. } if path == "data/items/Renamed_a1.json"
        ));

        let veto = |_: &mut Record| Verdict::Veto;
        let m = materializer().with_transformer(Arc::new(veto));
        let outcome = m
            .on_update(update(json!({"_id": "a1", "name": "Original"}), "items"))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Vetoed);
        assert!(m.fs().file_paths().is_empty());
    }

    #[tokio::test]
    async fn test_adventure_exclusion() {
        let options = SyncOptions {
            ignore_adventure_hmr: true,
            ..SyncOptions::default()
        };
        let m = Materializer::new(Arc::new(InMemoryFs::new()), options);

        let outcome = m
            .on_update(update(
                json!({"_id": "adv1", "name": "Tomb", "_key": "!adventures!adv1"}),
                "adventures",
            ))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Ignored);
        assert!(!m.fs().exists("data/adventures").await.unwrap());

        let outcome = m
            .on_update(update(
                json!({"_id": "adv2", "name": "Keep", "type": "Adventure"}),
                "adventures",
            ))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Ignored);

        // Not excluded when the option is off
        let outcome = materializer()
            .on_update(update(
                json!({"_id": "adv1", "name": "Tomb", "_key": "!adventures!adv1"}),
                "adventures",
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Written { .. }));
    }

    #[tokio::test]
    async fn test_delete_moves_into_deleted_dir() {
        let m = materializer();
        m.on_update(update(json!({"_id": "abc123", "name": "Goblin"}), "monsters"))
            .await
            .unwrap();

        let outcome = m.on_delete(delete("abc123", "monsters")).await.unwrap();
        assert_eq!(
            outcome,
            DeleteOutcome::Moved(vec!["data/monsters/Goblin_abc123.json".into()])
        );
        assert_eq!(
            m.fs().file_paths(),
            vec!["data/monsters/_deleted/Goblin_abc123.json".to_string()]
        );

        // A second delete finds nothing; `_deleted` is a directory and skipped
        let outcome = m.on_delete(delete("abc123", "monsters")).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_delete_missing_pack_dir() {
        let m = materializer();
        let outcome = m.on_delete(delete("abc123", "nowhere")).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_delete_ignores_adventure() {
        let options = SyncOptions {
            ignore_adventure_hmr: true,
            ..SyncOptions::default()
        };
        let fs = Arc::new(InMemoryFs::new());
        fs.mkdir("data/adventures").await.unwrap();
        fs.write(
            "data/adventures/Tomb_adv1.json",
            br#"{"_id":"adv1","name":"Tomb","_key":"!adventures!adv1"}"#,
        )
        .await
        .unwrap();

        let m = Materializer::new(Arc::clone(&fs), options);
        let outcome = m.on_delete(delete("adv1", "adventures")).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Ignored);
        assert!(fs.exists("data/adventures/Tomb_adv1.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_ledger_recognizes_own_write() {
        let m = materializer();
        m.on_update(update(json!({"_id": "abc123", "name": "Goblin"}), "monsters"))
            .await
            .unwrap();

        let ledger = m.ledger();
        let path = "data/monsters/Goblin_abc123.json";
        let content = m.fs().read(path).await.unwrap();
        assert!(ledger.take_echo(path, &content));
        // Consumed
        assert!(!ledger.take_echo(path, &content));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_passes_external_edit() {
        let ledger = WriteLedger::new();
        ledger.record("data/p/a.json", b"{}\n");
        assert!(!ledger.take_echo("data/p/a.json", b"{\"x\":1}\n"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_is_adventure() {
        assert!(is_adventure(&record(json!({"type": "Adventure"}))));
        assert!(is_adventure(&record(json!({"_key": "!adventures!x"}))));
        assert!(!is_adventure(&record(json!({"type": "npc", "_key": "!actors!x"}))));
    }
}
