//! FileSystem trait abstraction for the materializer.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in sync-server) - Uses tokio::fs
//!
//! Paths are `/`-separated and relative to the filesystem's root.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents, fully replacing any existing file
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Move a file
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Join two `/`-separated path segments.
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
        }
    }

    /// All file paths currently stored, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        self.files.read().unwrap().keys().cloned().collect()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn create_dirs(&self, path: &str) {
        let mut dirs = self.dirs.write().unwrap();
        let mut current = Some(Self::normalize_path(path));
        while let Some(dir) = current {
            current = Self::parent_path(&dir);
            dirs.insert(dir);
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);

        if let Some(parent) = Self::parent_path(&path) {
            if !self.dirs.read().unwrap().contains(&parent) {
                return Err(FsError::NotFound(parent));
            }
        }

        let mut files = self.files.write().unwrap();
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap();
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();

        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        let files = self.files.read().unwrap();
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.contains('/') {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap();
        files
            .remove(&path)
            .map(|_| ())
            .ok_or(FsError::NotFound(path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);

        if let Some(parent) = Self::parent_path(&to) {
            if !self.dirs.read().unwrap().contains(&parent) {
                return Err(FsError::NotFound(parent));
            }
        }

        let mut files = self.files.write().unwrap();
        let content = files.remove(&from).ok_or_else(|| FsError::NotFound(from))?;
        files.insert(to, content);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.create_dirs(path);
        Ok(())
    }
}

// Lets a test keep a handle on the filesystem it hands to a Materializer.
#[async_trait]
impl<T: FileSystem> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.json", b"{}").await.unwrap();

        let content = fs.read("test.json").await.unwrap();
        assert_eq!(content, b"{}");

        assert!(fs.exists("test.json").await.unwrap());
        assert!(!fs.exists("nonexistent.json").await.unwrap());

        fs.delete("test.json").await.unwrap();
        assert!(!fs.exists("test.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_requires_parent_directory() {
        let fs = InMemoryFs::new();

        assert!(matches!(
            fs.write("data/monsters/a.json", b"{}").await,
            Err(FsError::NotFound(_))
        ));

        fs.mkdir("data/monsters").await.unwrap();
        fs.write("data/monsters/a.json", b"{}").await.unwrap();

        let entries = fs.list("data").await.unwrap();
        assert_eq!(
            entries,
            vec![FileEntry {
                name: "monsters".into(),
                is_dir: true
            }]
        );
    }

    #[tokio::test]
    async fn test_rename_moves_content() {
        let fs = InMemoryFs::new();
        fs.mkdir("pack/_deleted").await.unwrap();
        fs.write("pack/a.json", b"content").await.unwrap();

        fs.rename("pack/a.json", "pack/_deleted/a.json").await.unwrap();

        assert!(!fs.exists("pack/a.json").await.unwrap());
        assert_eq!(fs.read("pack/_deleted/a.json").await.unwrap(), b"content");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("data", "monsters"), "data/monsters");
        assert_eq!(join("data/", "monsters"), "data/monsters");
        assert_eq!(join("", "monsters"), "monsters");
    }
}
