//! Transformer backed by an external command.
//!
//! The record is written to the command's stdin as JSON. A zero exit with a
//! JSON object on stdout replaces the record; empty output keeps it as is.
//! Output `false` or a non-zero exit vetoes the write.

use async_trait::async_trait;
use compendium_sync_core::document::Record;
use compendium_sync_core::transform::{Transformer, Verdict};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Build a command that runs `command_line` through the platform shell.
pub fn shell(command_line: &str) -> Command {
    let (program, flag) = if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };
    let mut command = Command::new(program);
    command.arg(flag).arg(command_line);
    command
}

/// Quote `value` as a single argument for the shell used by [`shell`].
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c) || (cfg!(windows) && c == '\\')
        });
    if plain {
        value.to_string()
    } else if cfg!(windows) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

pub struct CommandTransformer {
    command_line: String,
}

impl CommandTransformer {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
        }
    }

    async fn run(&self, input: &[u8]) -> anyhow::Result<std::process::Output> {
        let mut child = shell(&self.command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            // Dropping stdin closes the pipe so the command sees EOF
        }

        Ok(child.wait_with_output().await?)
    }
}

#[async_trait]
impl Transformer for CommandTransformer {
    async fn transform(&self, record: &mut Record) -> Verdict {
        let input = serde_json::to_vec(record).expect("JSON map serialization should not fail");

        let output = match self.run(&input).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Transformer `{}` failed to run: {}", self.command_line, e);
                return Verdict::Veto;
            }
        };

        if !output.status.success() {
            debug!("Transformer exited with {}", output.status);
            return Verdict::Veto;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Verdict::Keep;
        }
        if stdout == "false" {
            return Verdict::Veto;
        }

        match serde_json::from_str::<Record>(stdout) {
            Ok(transformed) => {
                *record = transformed;
                Verdict::Keep
            }
            Err(e) => {
                warn!("Transformer output is not a JSON object: {}", e);
                Verdict::Veto
            }
        }
    }
}
