//! The write verb: policy-checked, atomic file writes through the
//! read-write I/O container.
//!
//! The content travels over the container's stdin and lands via a
//! temp-write-and-rename inside the mount, so the host process itself never
//! opens the target for writing. Backups of existing files are taken by a
//! separate copy step beforehand; `.go` and `.json` bodies are pretty-
//! printed when possible and written unmodified otherwise.

use crate::{
    error::{CommandError, ErrorKind},
    executor::{Executor, Outcome, WriteAction, WriteOutcome},
    policy,
    sandbox::{RunRequestBuilder, WORKSPACE},
    scanner::Command,
    search::hex_sha256,
};
use anyhow::Result;
use chrono::Utc;
use log::debug;
use std::{io, path::Path, process::Stdio};
use tokio::io::AsyncWriteExt;

/// Retained backups per original file.
const BACKUP_KEEP: usize = 5;

/// Script step exit codes, used to classify in-container failures without
/// parsing stderr.
const EXIT_MKDIR: i64 = 91;

impl Executor {
    pub(crate) async fn handle_write(&self, command: &Command) -> Outcome {
        let path = match policy::validate_path(
            command.argument(),
            self.config.repo_root(),
            self.config.exclude_patterns(),
        ) {
            Ok(path) => path,
            Err(e) => return Outcome::failure(e),
        };
        if let Err(e) = policy::validate_extension(&path, self.config.allowed_write_extensions()) {
            return Outcome::failure(e);
        }

        let content = command.content().clone().unwrap_or_default();
        if content.len() as u64 > self.config.max_write_size() {
            return Outcome::failure(CommandError::new(
                ErrorKind::ResourceLimit,
                format!(
                    "content is {} bytes, write limit is {}",
                    content.len(),
                    self.config.max_write_size()
                ),
            ));
        }

        let relative = match path.strip_prefix(self.config.repo_root()) {
            Ok(relative) if !relative.as_os_str().is_empty() => {
                relative.to_string_lossy().into_owned()
            }
            _ => {
                return Outcome::failure(CommandError::new(
                    ErrorKind::WriteContainer,
                    "refusing to write the repository root itself",
                ))
            }
        };

        let action = match tokio::fs::metadata(&path).await {
            Ok(_) => WriteAction::Updated,
            Err(e) if e.kind() == io::ErrorKind::NotFound => WriteAction::Created,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Outcome::failure(CommandError::new(
                    ErrorKind::PermissionDenied,
                    format!("stat {}: {}", path.display(), e),
                ))
            }
            Err(e) => {
                return Outcome::failure(CommandError::new(
                    ErrorKind::ReadError,
                    format!("stat {}: {}", path.display(), e),
                ))
            }
        };

        let content = format_content(&path, content).await;

        let mut backup = None;
        if action == WriteAction::Updated && self.config.backup_on_write() {
            match self.take_backup(&relative).await {
                Ok(name) => backup = Some(name),
                Err(e) => return Outcome::failure(e),
            }
            self.prune_backups(&path);
        }

        if let Err(e) = self.write_through_container(&relative, &content).await {
            return Outcome::failure(e);
        }

        let outcome = WriteOutcome {
            bytes_written: content.len() as u64,
            action,
            backup: backup.clone(),
            content_hash: hex_sha256(content.as_bytes()),
        };

        let mut detail = format!(
            "hash:{},bytes:{},action:{}",
            outcome.content_hash, outcome.bytes_written, action
        );
        if let Some(name) = &backup {
            detail.push_str(&format!(",backup:{name}"));
        }

        let mut result = format!(
            "Wrote {} bytes to {} ({})",
            outcome.bytes_written, relative, action
        );
        if let Some(name) = &backup {
            result.push_str(&format!(", backup {name}"));
        }

        Outcome::success(result, detail).with_write(outcome)
    }

    /// Copy the existing file aside inside the I/O container. Returns the
    /// backup file name.
    async fn take_backup(&self, relative: &str) -> Result<String, CommandError> {
        let backup_relative = format!("{}.bak.{}", relative, Utc::now().timestamp());
        let script = format!(
            "cp -p -- {} {}",
            quote(&format!("{WORKSPACE}/{relative}")),
            quote(&format!("{WORKSPACE}/{backup_relative}")),
        );

        let outcome = match self.run_io_container(&script, None).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(CommandError::wrap(ErrorKind::BackupFailed, &e)),
        };
        if !outcome.success() {
            return Err(CommandError::new(
                ErrorKind::BackupFailed,
                format!(
                    "backup copy exited with {}: {}",
                    outcome.exit_code(),
                    outcome.stderr().trim()
                ),
            ));
        }

        Ok(Path::new(&backup_relative)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(backup_relative))
    }

    /// Atomic temp-write-and-rename inside the read-write mount. Step exit
    /// codes classify the failure.
    async fn write_through_container(
        &self,
        relative: &str,
        content: &str,
    ) -> Result<(), CommandError> {
        let target = format!("{WORKSPACE}/{relative}");
        let temp = format!("{}.tmp.{}", target, Utc::now().timestamp());
        let parent = match target.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => WORKSPACE.to_string(),
        };

        let script = format!(
            "mkdir -p -- {} || exit 91; cat > {} || exit 92; mv -- {} {} || exit 93",
            quote(&parent),
            quote(&temp),
            quote(&temp),
            quote(&target),
        );

        let outcome = match self.run_io_container(&script, Some(content)).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(CommandError::wrap(ErrorKind::WriteContainer, &e)),
        };

        if outcome.timed_out() {
            return Err(CommandError::new(
                ErrorKind::WriteContainer,
                format!(
                    "write container timed out after {}s",
                    self.config.io_timeout_secs()
                ),
            ));
        }
        match outcome.exit_code() {
            0 => Ok(()),
            EXIT_MKDIR => Err(CommandError::new(
                ErrorKind::DirectoryCreationFailed,
                format!(
                    "unable to create {}: {}",
                    parent,
                    outcome.stderr().trim()
                ),
            )),
            code => Err(CommandError::new(
                ErrorKind::WriteContainer,
                format!(
                    "write script exited with {}: {}",
                    code,
                    outcome.stderr().trim()
                ),
            )),
        }
    }

    async fn run_io_container(
        &self,
        script: &str,
        stdin: Option<&str>,
    ) -> Result<crate::sandbox::RunOutcome> {
        let mut builder = RunRequestBuilder::default()
            .image(self.config.io_image().clone())
            .command(script)
            .repo_root(self.config.repo_root().clone())
            .read_write(true)
            .memory(self.config.io_memory().clone())
            .cpus(self.config.io_cpus())
            .timeout(self.config.io_timeout());
        if let Some(stdin) = stdin {
            builder = builder.stdin(stdin);
        }

        self.sandbox.run(&builder.build()?).await
    }

    /// Keep only the newest [`BACKUP_KEEP`] backups of a file. Host-side
    /// maintenance; failures are logged and ignored.
    fn prune_backups(&self, path: &Path) {
        let (Some(parent), Some(file_name)) =
            (path.parent(), path.file_name().map(|n| n.to_string_lossy()))
        else {
            return;
        };

        if let Err(e) = prune_backup_files(parent, &file_name, BACKUP_KEEP) {
            debug!("Backup pruning for {} failed: {:#}", path.display(), e);
        }
    }
}

fn prune_backup_files(parent: &Path, file_name: &str, keep: usize) -> Result<()> {
    let prefix = format!("{file_name}.bak.");
    let mut backups: Vec<String> = std::fs::read_dir(parent)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(&prefix))
        .collect();

    // Timestamps have a fixed digit count, so the lexical order is the
    // chronological order.
    backups.sort_unstable_by(|a, b| b.cmp(a));
    for stale in backups.iter().skip(keep) {
        std::fs::remove_file(parent.join(stale))?;
    }
    Ok(())
}

/// Single-quote a string for the in-container shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Pretty-print `.json` and `.go` content; anything unparseable is written
/// unmodified.
async fn format_content(path: &Path, content: String) -> String {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("json") => match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(value) => serde_json::to_string_pretty(&value).unwrap_or(content),
            Err(_) => content,
        },
        Some("go") => format_go(content).await,
        _ => content,
    }
}

async fn format_go(content: String) -> String {
    let Ok(gofmt) = which::which("gofmt") else {
        return content;
    };

    let spawned = tokio::process::Command::new(gofmt)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();
    let Ok(mut child) = spawned else {
        return content;
    };

    if let Some(stdin) = child.stdin.as_mut() {
        if stdin.write_all(content.as_bytes()).await.is_err() {
            return content;
        }
    }
    drop(child.stdin.take());

    match child.wait_with_output().await {
        Ok(output) if output.status.success() => {
            String::from_utf8(output.stdout).unwrap_or(content)
        }
        _ => content,
    }
}
