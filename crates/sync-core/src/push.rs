//! Push-back of on-disk edits to the running application.

use crate::config::SyncOptions;
use crate::fs::{FileSystem, FsError, Result};
use crate::materialize::{WriteLedger, DELETED_DIR};
use crate::protocol::{ServerMessage, SystemUpdate};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use web_time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Turns file change notifications into `system-update` messages.
pub struct PushBack<F: FileSystem> {
    fs: F,
    data_directory: String,
    ledger: Arc<WriteLedger>,
}

impl<F: FileSystem> PushBack<F> {
    pub fn new(fs: F, options: &SyncOptions, ledger: Arc<WriteLedger>) -> Self {
        Self {
            fs,
            data_directory: options.data_root(),
            ledger,
        }
    }

    /// Whether a project-relative path is a pack source file.
    pub fn is_watched(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(&self.data_directory) else {
            return false;
        };
        let Some(rest) = rest.strip_prefix('/') else {
            return false;
        };
        rest.ends_with(".json") && !rest.split('/').any(|segment| segment == DELETED_DIR)
    }

    /// Build the push-back for a changed file, or `None` if there is nothing
    /// to push: unwatched path, file gone, our own write, unparseable content.
    pub async fn on_file_changed(&self, path: &str) -> Result<Option<ServerMessage>> {
        if !self.is_watched(path) {
            return Ok(None);
        }

        let content = match self.fs.read(path).await {
            Ok(content) => content,
            Err(FsError::NotFound(_)) => {
                debug!("{} disappeared before it could be read", path);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if self.ledger.take_echo(path, &content) {
            debug!("Skipping echo of our own write to {}", path);
            return Ok(None);
        }

        let value: Value = match serde_json::from_slice(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to parse {}: {}", path, e);
                return Ok(None);
            }
        };

        Ok(Some(ServerMessage::SystemUpdate(SystemUpdate {
            json: value.to_string(),
            timestamp: now_millis(),
            file: path.to_string(),
        })))
    }
}
