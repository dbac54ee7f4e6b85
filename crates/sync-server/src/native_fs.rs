//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use compendium_sync_core::fs::{FileEntry, FileSystem, FsError, Result};
use std::io;
use std::path::PathBuf;
use tokio::fs;

/// Native filesystem rooted at the project directory
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn io_error(path: &str, e: io::Error) -> FsError {
    if e.kind() == io::ErrorKind::NotFound {
        FsError::NotFound(path.to_string())
    } else {
        FsError::Io(format!("{}: {}", path, e))
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        if full_path.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::read(&full_path).await.map_err(|e| io_error(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path);
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await.map_err(|e| io_error(path, e))?;

            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
            });
        }

        // read_dir order is platform dependent
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path)
                .await
                .map_err(|e| io_error(path, e))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| io_error(path, e))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.full_path(from), self.full_path(to))
            .await
            .map_err(|e| io_error(from, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        fs::try_exists(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }
}
