//! Build-time compilation of the data directory into packs.

use crate::transform::{shell, shell_quote};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use compendium_sync_core::config::SyncOptions;
use compendium_sync_core::materialize::DELETED_DIR;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// Default `--compiler` template.
pub const DEFAULT_COMPILER: &str = "fvtt package pack {name} --in {src} --out {out}";

/// Compiles one leaf pack folder.
#[async_trait]
pub trait PackCompiler: Send + Sync {
    /// Compile `src` into the pack `name` at `dest`.
    async fn compile(&self, name: &str, src: &Path, dest: &Path) -> Result<()>;
}

/// Runs an external program built from a template.
///
/// Placeholders: `{name}` pack name, `{src}` source folder, `{dest}` pack
/// output folder, `{out}` output directory.
pub struct CommandCompiler {
    template: String,
}

impl CommandCompiler {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Substituted values are shell-quoted, so paths may contain spaces.
    pub fn command_line(&self, name: &str, src: &Path, dest: &Path) -> String {
        let out = dest.parent().unwrap_or(dest);
        let quoted = |path: &Path| shell_quote(&path.display().to_string());
        self.template
            .replace("{name}", &shell_quote(name))
            .replace("{src}", &quoted(src))
            .replace("{dest}", &quoted(dest))
            .replace("{out}", &quoted(out))
    }
}

impl Default for CommandCompiler {
    fn default() -> Self {
        Self::new(DEFAULT_COMPILER)
    }
}

#[async_trait]
impl PackCompiler for CommandCompiler {
    async fn compile(&self, name: &str, src: &Path, dest: &Path) -> Result<()> {
        let command_line = self.command_line(name, src, dest);
        info!("Running {}", command_line);
        let status = shell(&command_line)
            .status()
            .await
            .with_context(|| format!("Failed to run `{}`", command_line))?;
        if !status.success() {
            bail!("`{}` exited with {}", command_line, status);
        }
        Ok(())
    }
}

/// Remove everything inside `out`, or create it.
async fn clean_output(out: &Path) -> Result<()> {
    info!("Cleaning {}...", out.display());
    if fs::try_exists(out).await? {
        let mut entries = fs::read_dir(out).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }
    } else {
        fs::create_dir_all(out).await?;
    }
    Ok(())
}

/// Sub-directories of `dir` that hold pack content, sorted by name.
async fn pack_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() && entry.file_name() != DELETED_DIR {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Compile every leaf pack folder under the data directory.
///
/// A folder with sub-folders (other than `_deleted`) is a grouping and is
/// descended into; every other folder is a pack. Returns the number of
/// packs compiled.
pub async fn compile_packs(
    root: &Path,
    options: &SyncOptions,
    compiler: &dyn PackCompiler,
) -> Result<usize> {
    let out = root.join(options.output_root());
    clean_output(&out).await?;

    let data = root.join(options.data_root());
    if !fs::try_exists(&data).await? {
        warn!("Data directory {} does not exist, nothing to compile", data.display());
        return Ok(0);
    }

    let mut compiled = 0;
    let mut pending = pack_dirs(&data).await?;
    pending.reverse();
    while let Some(dir) = pending.pop() {
        let children = pack_dirs(&dir).await?;
        if !children.is_empty() {
            pending.extend(children.into_iter().rev());
            continue;
        }

        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            warn!("Skipping pack folder with non UTF-8 name: {}", dir.display());
            continue;
        };
        let dest = out.join(name);
        fs::create_dir_all(&dest).await?;
        compiler
            .compile(name, &dir, &dest)
            .await
            .with_context(|| format!("Failed to compile pack {}", name))?;
        info!("Compiled pack {}", name);
        compiled += 1;
    }

    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingCompiler {
        calls: Mutex<Vec<(String, PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl PackCompiler for RecordingCompiler {
        async fn compile(&self, name: &str, src: &Path, dest: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), src.to_path_buf(), dest.to_path_buf()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_leaf_folders_are_compiled() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("data/monsters/_deleted")).unwrap();
        std::fs::create_dir_all(root.join("data/spells/arcane")).unwrap();
        std::fs::create_dir_all(root.join("data/spells/divine")).unwrap();
        std::fs::write(root.join("data/monsters/Goblin_abc.json"), "{}").unwrap();

        let compiler = RecordingCompiler::default();
        let count = compile_packs(root, &SyncOptions::default(), &compiler)
            .await
            .unwrap();
        assert_eq!(count, 3);

        let calls = compiler.calls.lock().unwrap();
        let names: Vec<&str> = calls.iter().map(|(name, _, _)| name.as_str()).collect();
        assert_eq!(names, vec!["monsters", "arcane", "divine"]);
        assert_eq!(calls[1].1, root.join("data/spells/arcane"));
        assert_eq!(calls[1].2, root.join("packs/arcane"));
        assert!(root.join("packs/arcane").is_dir());
    }

    #[tokio::test]
    async fn test_output_is_cleaned() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("packs/stale/nested")).unwrap();
        std::fs::write(root.join("packs/old.db"), "x").unwrap();

        let compiler = RecordingCompiler::default();
        let count = compile_packs(root, &SyncOptions::default(), &compiler)
            .await
            .unwrap();

        // Missing data directory is not an error
        assert_eq!(count, 0);
        assert!(root.join("packs").is_dir());
        assert_eq!(std::fs::read_dir(root.join("packs")).unwrap().count(), 0);
    }

    #[test]
    fn test_command_template() {
        let compiler = CommandCompiler::default();
        let line = compiler.command_line(
            "monsters",
            Path::new("data/monsters"),
            Path::new("packs/monsters"),
        );
        assert_eq!(
            line,
            "fvtt package pack monsters --in data/monsters --out packs"
        );

        let compiler = CommandCompiler::new("pack {name} {src} {dest}");
        assert_eq!(
            compiler.command_line("a", Path::new("s"), Path::new("o/a")),
            "pack a s o/a"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_command_template_quotes_paths() {
        let compiler = CommandCompiler::new("pack {name} --in {src} --out {out}");
        let line = compiler.command_line(
            "it's",
            Path::new("/home/me/My Project/data/it's"),
            Path::new("/home/me/My Project/packs/it's"),
        );
        assert_eq!(
            line,
            r#"pack 'it'\''s' --in '/home/me/My Project/data/it'\''s' --out '/home/me/My Project/packs'"#
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compile_in_path_with_spaces() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("My Project");
        std::fs::create_dir_all(root.join("data/monsters")).unwrap();

        let compiler = CommandCompiler::new("test -d {src} && test -d {dest}");
        let count = compile_packs(&root, &SyncOptions::default(), &compiler)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
