//! Append-only audit logging.
//!
//! Every attempted command produces exactly one audit entry, including the
//! full unsanitized error text on failure. The log file is pipe-delimited,
//! one record per line:
//!
//! `RFC3339|session:<ID>|<verb>|<argument>|success|<detail>`
//!
//! Values are written verbatim; readers must tolerate unescaped pipes in
//! the detail field.

use anyhow::{Context, Result};
use chrono::Utc;
use log::error;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};

/// The audit callback seam. The executor holds one sink reference; tests
/// substitute an in-memory recorder.
pub trait AuditSink: Send + Sync {
    fn log(&self, verb: &str, argument: &str, success: bool, detail: &str);
}

/// File-backed audit sink. The file handle is exclusively owned and
/// protected by a mutex; each entry is written and flushed as a single
/// line, so concurrent callers never interleave within a record.
pub struct FileAuditLog {
    session: String,
    file: Mutex<File>,
}

impl FileAuditLog {
    /// Open (or create) the audit file in append mode.
    pub fn open(path: &Path, session: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create audit log directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;

        Ok(Self {
            session: session.into(),
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditLog {
    fn log(&self, verb: &str, argument: &str, success: bool, detail: &str) {
        let line = format!(
            "{}|session:{}|{}|{}|{}|{}",
            Utc::now().to_rfc3339(),
            self.session,
            verb,
            argument,
            if success { "success" } else { "failed" },
            detail,
        );

        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            // The audit trail must never take a command down with it.
            error!("unable to append audit entry: {e}");
        }
    }
}

/// In-memory audit recorder for tests.
#[derive(Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub verb: String,
    pub argument: String,
    pub success: bool,
    pub detail: String,
}

impl RecordingAudit {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit entries lock").clone()
    }
}

impl AuditSink for RecordingAudit {
    fn log(&self, verb: &str, argument: &str, success: bool, detail: &str) {
        self.entries.lock().expect("audit entries lock").push(AuditEntry {
            verb: verb.into(),
            argument: argument.into(),
            success,
            detail: detail.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn entries_are_single_pipe_delimited_lines() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("audit.log");
        let audit = FileAuditLog::open(&path, "s-1")?;

        audit.log("open", "README.md", true, "bytes:3");
        audit.log("exec", "ls -la", false, "exit_code:2,status:failed");

        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let fields: Vec<&str> = lines[0].splitn(6, '|').collect();
        assert_eq!(fields[1], "session:s-1");
        assert_eq!(fields[2], "open");
        assert_eq!(fields[3], "README.md");
        assert_eq!(fields[4], "success");
        assert_eq!(fields[5], "bytes:3");

        assert!(lines[1].contains("|failed|"));
        Ok(())
    }

    #[test]
    fn missing_parent_directory_is_created() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested/dir/audit.log");
        let audit = FileAuditLog::open(&path, "s")?;
        audit.log("search", "query", true, "hits:0");
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn concurrent_writers_never_interleave_within_a_record() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("audit.log");
        let audit = Arc::new(FileAuditLog::open(&path, "s")?);

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let audit = Arc::clone(&audit);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        audit.log("exec", &format!("cmd-{worker}-{i}"), true, "ok");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("audit writer thread");
        }

        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 8 * 50);
        for line in lines {
            assert_eq!(line.splitn(6, '|').count(), 6);
        }
        Ok(())
    }

    #[test]
    fn recorder_captures_flags() {
        let audit = RecordingAudit::default();
        audit.log("write", "a.txt", false, "BACKUP_FAILED: disk full");

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert!(entries[0].detail.contains("disk full"));
    }
}
